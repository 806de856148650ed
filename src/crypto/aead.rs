//! AEAD framing for the tunnel.
//!
//! Stream direction: `salt || [enc(len_be16) || enc(payload)]...` with each
//! record capped at [`MAX_PAYLOAD_LEN`] bytes and a little-endian nonce
//! counter advanced once per AEAD operation. UDP: one-shot
//! `salt || enc(addr || payload)` with an all-zero nonce.

use super::{derive_session_key, CipherKind, ReplayCache};
use crate::{Error, Result};
use aes::Aes192;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use bytes::{BufMut, BytesMut};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305, XNonce};
use std::sync::Arc;

/// AES-192-GCM is not pre-aliased by the aes-gcm crate.
type Aes192Gcm = AesGcm<Aes192, U12>;

/// Maximum payload bytes per record; the top two bits of the length field
/// must be zero.
pub const MAX_PAYLOAD_LEN: usize = 0x3FFF;

/// A session cipher bound to one derived subkey.
enum SessionCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
    XChaCha(Box<XChaCha20Poly1305>),
}

impl SessionCipher {
    fn new(kind: CipherKind, session_key: &[u8]) -> Result<Self> {
        Ok(match kind {
            CipherKind::Aes128Gcm => SessionCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(session_key)
                    .map_err(|_| Error::crypto("invalid key length"))?,
            )),
            CipherKind::Aes192Gcm => SessionCipher::Aes192(Box::new(
                Aes192Gcm::new_from_slice(session_key)
                    .map_err(|_| Error::crypto("invalid key length"))?,
            )),
            CipherKind::Aes256Gcm => SessionCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(session_key)
                    .map_err(|_| Error::crypto("invalid key length"))?,
            )),
            CipherKind::ChaCha20Poly1305 => SessionCipher::ChaCha(Box::new(
                ChaCha20Poly1305::new_from_slice(session_key)
                    .map_err(|_| Error::crypto("invalid key length"))?,
            )),
            CipherKind::XChaCha20Poly1305 => SessionCipher::XChaCha(Box::new(
                XChaCha20Poly1305::new_from_slice(session_key)
                    .map_err(|_| Error::crypto("invalid key length"))?,
            )),
        })
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = match self {
            SessionCipher::Aes128(c) => c.encrypt(Nonce::from_slice(nonce), plaintext),
            SessionCipher::Aes192(c) => c.encrypt(Nonce::from_slice(nonce), plaintext),
            SessionCipher::Aes256(c) => c.encrypt(Nonce::from_slice(nonce), plaintext),
            SessionCipher::ChaCha(c) => c.encrypt(Nonce::from_slice(nonce), plaintext),
            SessionCipher::XChaCha(c) => c.encrypt(XNonce::from_slice(nonce), plaintext),
        };
        sealed.map_err(|_| Error::crypto("AEAD seal failed"))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let opened = match self {
            SessionCipher::Aes128(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
            SessionCipher::Aes192(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
            SessionCipher::Aes256(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
            SessionCipher::ChaCha(c) => c.decrypt(Nonce::from_slice(nonce), ciphertext),
            SessionCipher::XChaCha(c) => c.decrypt(XNonce::from_slice(nonce), ciphertext),
        };
        opened.map_err(|_| Error::InvalidFrame("authentication tag mismatch"))
    }
}

/// Little-endian counter increment, one step per AEAD operation.
fn increment_nonce(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

/// Encrypting half of one tunnel direction.
pub struct Encryptor {
    cipher: SessionCipher,
    salt: Vec<u8>,
    nonce: Vec<u8>,
    salt_sent: bool,
    ops: u64,
}

impl Encryptor {
    pub fn new(kind: CipherKind, master_key: &[u8]) -> Result<Self> {
        let mut salt = vec![0u8; kind.salt_len()];
        getrandom::getrandom(&mut salt).map_err(|e| Error::crypto(e.to_string()))?;
        Self::with_salt(kind, master_key, salt)
    }

    fn with_salt(kind: CipherKind, master_key: &[u8], salt: Vec<u8>) -> Result<Self> {
        let session_key = derive_session_key(master_key, &salt, kind.key_len());
        Ok(Encryptor {
            cipher: SessionCipher::new(kind, &session_key)?,
            salt,
            nonce: vec![0u8; kind.nonce_len()],
            salt_sent: false,
            ops: 0,
        })
    }

    pub fn salt(&self) -> &[u8] {
        &self.salt
    }

    /// AEAD operations performed so far (= nonce counter value).
    pub fn seal_count(&self) -> u64 {
        self.ops
    }

    fn seal_chunk(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let sealed = self.cipher.seal(&self.nonce, data)?;
        increment_nonce(&mut self.nonce);
        self.ops += 1;
        Ok(sealed)
    }

    /// Frame and encrypt `plaintext`, splitting oversized chunks. The salt
    /// prelude is emitted in front of the first output.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<BytesMut> {
        let mut out = BytesMut::with_capacity(
            self.salt.len() + plaintext.len() + 64,
        );
        if !self.salt_sent {
            out.put_slice(&self.salt);
            self.salt_sent = true;
        }

        for chunk in plaintext.chunks(MAX_PAYLOAD_LEN) {
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            out.put_slice(&self.seal_chunk(&len_bytes)?);
            out.put_slice(&self.seal_chunk(chunk)?);
        }

        Ok(out)
    }
}

enum DecryptState {
    WaitSalt,
    WaitLength,
    WaitPayload { len: usize },
}

/// Decrypting half of one tunnel direction.
///
/// Stateful: feed it ciphertext as it arrives; complete records come back as
/// plaintext, an incomplete tail stays buffered (empty output = need more
/// input). Tag failures, replayed salts and out-of-range length records are
/// [`Error::InvalidFrame`].
pub struct Decryptor {
    kind: CipherKind,
    master_key: Vec<u8>,
    cipher: Option<SessionCipher>,
    nonce: Vec<u8>,
    state: DecryptState,
    buffer: BytesMut,
    replay: Arc<ReplayCache>,
    ops: u64,
}

impl Decryptor {
    pub fn new(kind: CipherKind, master_key: &[u8], replay: Arc<ReplayCache>) -> Self {
        Decryptor {
            kind,
            master_key: master_key.to_vec(),
            cipher: None,
            nonce: vec![0u8; kind.nonce_len()],
            state: DecryptState::WaitSalt,
            buffer: BytesMut::with_capacity(4096),
            replay,
            ops: 0,
        }
    }

    pub fn seal_count(&self) -> u64 {
        self.ops
    }

    fn open_chunk(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self
            .cipher
            .as_ref()
            .ok_or(Error::InvalidFrame("record before salt"))?;
        let opened = cipher.open(&self.nonce, ciphertext)?;
        increment_nonce(&mut self.nonce);
        self.ops += 1;
        Ok(opened)
    }

    /// Consume `input`, returning all plaintext that became available.
    pub fn decrypt(&mut self, input: &[u8]) -> Result<BytesMut> {
        self.buffer.extend_from_slice(input);
        let mut out = BytesMut::new();
        let tag_len = self.kind.tag_len();

        loop {
            match self.state {
                DecryptState::WaitSalt => {
                    let salt_len = self.kind.salt_len();
                    if self.buffer.len() < salt_len {
                        return Ok(out);
                    }
                    let salt = self.buffer.split_to(salt_len);
                    if !self.replay.insert_if_absent(&salt) {
                        return Err(Error::InvalidFrame("duplicate salt"));
                    }
                    let session_key =
                        derive_session_key(&self.master_key, &salt, self.kind.key_len());
                    self.cipher = Some(SessionCipher::new(self.kind, &session_key)?);
                    self.state = DecryptState::WaitLength;
                }
                DecryptState::WaitLength => {
                    if self.buffer.len() < 2 + tag_len {
                        return Ok(out);
                    }
                    let sealed_len = self.buffer.split_to(2 + tag_len);
                    let len_bytes = self.open_chunk(&sealed_len)?;
                    let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
                    if len == 0 || len > MAX_PAYLOAD_LEN {
                        return Err(Error::InvalidFrame("length record out of range"));
                    }
                    self.state = DecryptState::WaitPayload { len };
                }
                DecryptState::WaitPayload { len } => {
                    if self.buffer.len() < len + tag_len {
                        return Ok(out);
                    }
                    let sealed = self.buffer.split_to(len + tag_len);
                    let plaintext = self.open_chunk(&sealed)?;
                    out.put_slice(&plaintext);
                    self.state = DecryptState::WaitLength;
                }
            }
        }
    }
}

/// Seal one UDP datagram: fresh salt, zero nonce, single record.
pub fn seal_udp(kind: CipherKind, master_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut salt = vec![0u8; kind.salt_len()];
    getrandom::getrandom(&mut salt).map_err(|e| Error::crypto(e.to_string()))?;

    let session_key = derive_session_key(master_key, &salt, kind.key_len());
    let cipher = SessionCipher::new(kind, &session_key)?;
    let nonce = vec![0u8; kind.nonce_len()];

    let mut out = salt;
    out.extend_from_slice(&cipher.seal(&nonce, plaintext)?);
    Ok(out)
}

/// Open one UDP datagram, checking the salt against the replay window.
pub fn open_udp(
    kind: CipherKind,
    master_key: &[u8],
    datagram: &[u8],
    replay: &ReplayCache,
) -> Result<Vec<u8>> {
    let salt_len = kind.salt_len();
    if datagram.len() < salt_len + kind.tag_len() {
        return Err(Error::InvalidFrame("datagram too short"));
    }

    let (salt, sealed) = datagram.split_at(salt_len);
    if !replay.insert_if_absent(salt) {
        return Err(Error::InvalidFrame("duplicate salt"));
    }

    let session_key = derive_session_key(master_key, salt, kind.key_len());
    let cipher = SessionCipher::new(kind, &session_key)?;
    let nonce = vec![0u8; kind.nonce_len()];
    cipher.open(&nonce, sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::derive_key;

    const ALL_KINDS: [CipherKind; 5] = [
        CipherKind::Aes128Gcm,
        CipherKind::Aes192Gcm,
        CipherKind::Aes256Gcm,
        CipherKind::ChaCha20Poly1305,
        CipherKind::XChaCha20Poly1305,
    ];

    fn master(kind: CipherKind) -> Vec<u8> {
        derive_key("test-password", kind.key_len())
    }

    #[test]
    fn test_stream_roundtrip_all_ciphers() {
        for kind in ALL_KINDS {
            let key = master(kind);
            let mut enc = Encryptor::new(kind, &key).unwrap();
            let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));

            let plaintext = b"hello through the tunnel";
            let wire = enc.encrypt(plaintext).unwrap();
            assert_eq!(
                wire.len(),
                kind.salt_len() + 2 + kind.tag_len() + plaintext.len() + kind.tag_len()
            );

            let out = dec.decrypt(&wire).unwrap();
            assert_eq!(&out[..], plaintext, "cipher {}", kind.name());
        }
    }

    #[test]
    fn test_large_payload_splits_and_nonce_count() {
        let kind = CipherKind::Aes256Gcm;
        let key = master(kind);
        let mut enc = Encryptor::new(kind, &key).unwrap();
        let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));

        // 40000 bytes => ceil(40000 / 16383) = 3 records => 6 AEAD ops.
        let plaintext: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();
        let wire = enc.encrypt(&plaintext).unwrap();
        assert_eq!(enc.seal_count(), 6);

        let out = dec.decrypt(&wire).unwrap();
        assert_eq!(out.len(), plaintext.len());
        assert_eq!(&out[..], &plaintext[..]);
        assert_eq!(dec.seal_count(), 6);
    }

    #[test]
    fn test_byte_at_a_time_equals_whole_buffer() {
        let kind = CipherKind::ChaCha20Poly1305;
        let key = master(kind);
        let mut enc = Encryptor::new(kind, &key).unwrap();
        let plaintext = b"drip-fed ciphertext must decode identically";
        let wire = enc.encrypt(plaintext).unwrap();

        let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));
        let mut collected = Vec::new();
        let mut empty_steps = 0;
        for byte in wire.iter() {
            let out = dec.decrypt(std::slice::from_ref(byte)).unwrap();
            if out.is_empty() {
                empty_steps += 1;
            }
            collected.extend_from_slice(&out);
        }
        assert_eq!(collected, plaintext);
        // All intermediate feeds are need-more; only the final byte of the
        // payload record produces output.
        assert_eq!(empty_steps, wire.len() - 1);
    }

    #[test]
    fn test_multiple_writes_one_salt() {
        let kind = CipherKind::Aes128Gcm;
        let key = master(kind);
        let mut enc = Encryptor::new(kind, &key).unwrap();
        let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));

        let first = enc.encrypt(b"first").unwrap();
        let second = enc.encrypt(b"second").unwrap();
        // Salt appears once, in front of the first transmission only.
        assert_eq!(&first[..kind.salt_len()], enc.salt());
        assert_eq!(second.len(), 2 + 16 + 6 + 16);

        let mut out = dec.decrypt(&first).unwrap();
        out.extend_from_slice(&dec.decrypt(&second).unwrap());
        assert_eq!(&out[..], b"firstsecond");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let kind = CipherKind::Aes256Gcm;
        let key = master(kind);
        let mut enc = Encryptor::new(kind, &key).unwrap();
        let wire = enc.encrypt(b"integrity matters").unwrap();

        // Flip one bit in the payload record.
        let mut tampered = wire.to_vec();
        let last = tampered.len() - 1;
        tampered[last] ^= 0x01;

        let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));
        let err = dec.decrypt(&tampered).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame(_)));
    }

    #[test]
    fn test_tampered_salt_rejected() {
        let kind = CipherKind::Aes256Gcm;
        let key = master(kind);
        let mut enc = Encryptor::new(kind, &key).unwrap();
        let wire = enc.encrypt(b"salted").unwrap();

        let mut tampered = wire.to_vec();
        tampered[0] ^= 0xFF;

        let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));
        // Wrong salt derives the wrong subkey; the length record fails.
        assert!(dec.decrypt(&tampered).is_err());
    }

    #[test]
    fn test_replayed_salt_rejected_before_payload() {
        let kind = CipherKind::Aes256Gcm;
        let key = master(kind);
        let replay = Arc::new(ReplayCache::default());

        let mut enc = Encryptor::new(kind, &key).unwrap();
        let wire = enc.encrypt(b"once only").unwrap();

        let mut first = Decryptor::new(kind, &key, replay.clone());
        assert_eq!(&first.decrypt(&wire).unwrap()[..], b"once only");

        // Same stream again: rejected at the salt, no plaintext emitted.
        let mut second = Decryptor::new(kind, &key, replay);
        let err = second.decrypt(&wire[..kind.salt_len()]).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame("duplicate salt")));
    }

    #[test]
    fn test_length_record_bounds() {
        let kind = CipherKind::Aes256Gcm;
        let key = master(kind);

        for bad_len in [0u16, (MAX_PAYLOAD_LEN + 1) as u16] {
            let mut enc = Encryptor::new(kind, &key).unwrap();
            let mut wire = enc.salt().to_vec();
            enc.salt_sent = true;
            wire.extend_from_slice(&enc.seal_chunk(&bad_len.to_be_bytes()).unwrap());

            let mut dec = Decryptor::new(kind, &key, Arc::new(ReplayCache::default()));
            let err = dec.decrypt(&wire).unwrap_err();
            assert!(
                matches!(err, Error::InvalidFrame("length record out of range")),
                "length {} must be rejected",
                bad_len
            );
        }
    }

    #[test]
    fn test_udp_roundtrip() {
        for kind in ALL_KINDS {
            let key = master(kind);
            let replay = ReplayCache::default();

            // 7-byte address header plus 5 payload bytes.
            let datagram = seal_udp(kind, &key, b"\x01\x08\x08\x08\x08\x00\x35query").unwrap();
            assert_eq!(
                datagram.len(),
                kind.salt_len() + 12 + kind.tag_len()
            );

            let out = open_udp(kind, &key, &datagram, &replay).unwrap();
            assert_eq!(&out[..], b"\x01\x08\x08\x08\x08\x00\x35query");
        }
    }

    #[test]
    fn test_udp_replay_rejected() {
        let kind = CipherKind::Aes128Gcm;
        let key = master(kind);
        let replay = ReplayCache::default();

        let datagram = seal_udp(kind, &key, b"payload").unwrap();
        open_udp(kind, &key, &datagram, &replay).unwrap();
        let err = open_udp(kind, &key, &datagram, &replay).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame("duplicate salt")));
    }

    #[test]
    fn test_udp_short_datagram() {
        let kind = CipherKind::Aes128Gcm;
        let key = master(kind);
        let replay = ReplayCache::default();
        let err = open_udp(kind, &key, &[0u8; 8], &replay).unwrap_err();
        assert!(matches!(err, Error::InvalidFrame("datagram too short")));
    }
}
