//! Cipher suites and key derivation.
//!
//! Only the modern AEAD suites are supported; legacy stream and table
//! ciphers are rejected at configuration time.

pub mod aead;
pub mod replay;

pub use aead::{open_udp, seal_udp, Decryptor, Encryptor, MAX_PAYLOAD_LEN};
pub use replay::ReplayCache;

use crate::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

/// HKDF info string fixed by the Shadowsocks AEAD protocol.
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    XChaCha20Poly1305,
}

impl CipherKind {
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes192Gcm => "aes-192-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
            CipherKind::XChaCha20Poly1305 => "xchacha20-ietf-poly1305",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm
            | CipherKind::ChaCha20Poly1305
            | CipherKind::XChaCha20Poly1305 => 32,
        }
    }

    pub fn salt_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes192Gcm => 24,
            CipherKind::Aes256Gcm
            | CipherKind::ChaCha20Poly1305
            | CipherKind::XChaCha20Poly1305 => 32,
        }
    }

    pub fn nonce_len(&self) -> usize {
        match self {
            CipherKind::XChaCha20Poly1305 => 24,
            _ => 12,
        }
    }

    pub fn tag_len(&self) -> usize {
        16
    }
}

impl TryFrom<&str> for CipherKind {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-192-gcm" => Ok(CipherKind::Aes192Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "xchacha20-ietf-poly1305" => Ok(CipherKind::XChaCha20Poly1305),
            _ => Err(Error::config(format!("Unsupported cipher: {}", s))),
        }
    }
}

/// Derive the master key from a password, compatible with OpenSSL
/// `EVP_BytesToKey(MD5, salt=none, iterations=1)`. Interoperability only,
/// not a KDF with any strength.
pub fn derive_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut prev: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password.as_bytes());
        prev = hasher.finalize().to_vec();
        key.extend_from_slice(&prev);
    }

    key.truncate(key_len);
    key
}

/// Parse an explicit base64url-encoded master key.
pub fn parse_key(encoded: &str, key_len: usize) -> Result<Vec<u8>> {
    let trimmed = encoded.trim_end_matches('=');
    let mut decoded = URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| Error::config(format!("Invalid key encoding: {}", e)))?;

    if decoded.len() < key_len {
        return Err(Error::config(format!(
            "Key too short: {} bytes, need {}",
            decoded.len(),
            key_len
        )));
    }

    decoded.truncate(key_len);
    Ok(decoded)
}

/// Per-session subkey: HKDF-SHA1(salt, master, "ss-subkey").
pub fn derive_session_key(master_key: &[u8], salt: &[u8], key_len: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .expect("subkey length within HKDF bounds");
    subkey
}
