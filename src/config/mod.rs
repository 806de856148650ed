//! Configuration loading and validation.

use crate::acl::AclMode;
use crate::common::net::MptcpMode;
use crate::crypto::CipherKind;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Upstream relay addresses (`host:port`). One is picked at random per
    /// session.
    pub servers: Vec<String>,

    /// Local SOCKS5 listen address.
    pub local: String,

    /// Offer UDP ASSOCIATE and run the UDP relay.
    pub udp: bool,

    /// AEAD cipher method name.
    pub method: String,

    /// Password for EVP_BytesToKey derivation.
    pub password: Option<String>,

    /// Explicit base64url master key; takes precedence over `password`.
    pub key: Option<String>,

    /// Idle timeout in seconds for TCP connections and UDP peers.
    pub timeout: u64,

    /// Datagram buffer sizing for the UDP relay.
    pub mtu: usize,

    /// Multipath TCP mode: `off`, `any`, or a fixed option number.
    pub mptcp: String,

    pub fast_open: bool,

    pub reuse_port: bool,

    /// Prefer IPv6 records when resolving.
    pub ipv6_first: bool,

    /// Bind outbound sockets to this interface.
    pub interface: Option<String>,

    /// When set, upstream traffic goes to `127.0.0.1:<plugin-port>` and the
    /// plugin subprocess handles the network hop.
    pub plugin_port: Option<u16>,

    pub acl: Option<AclConfig>,

    /// Resolver upstreams; empty uses the system configuration.
    pub nameserver: Vec<String>,

    /// Per-connection logging.
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AclConfig {
    /// `blacklist` (default proxy) or `whitelist` (default direct).
    pub mode: String,
    /// Rules forcing a direct connection.
    pub bypass: Vec<String>,
    /// Rules forcing the tunnel.
    pub proxy: Vec<String>,
}

impl Default for AclConfig {
    fn default() -> Self {
        AclConfig {
            mode: "blacklist".to_string(),
            bypass: Vec::new(),
            proxy: Vec::new(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            servers: Vec::new(),
            local: "127.0.0.1:1080".to_string(),
            udp: false,
            method: "chacha20-ietf-poly1305".to_string(),
            password: None,
            key: None,
            timeout: 60,
            mtu: 1500,
            mptcp: "off".to_string(),
            fast_open: false,
            reuse_port: false,
            ipv6_first: false,
            interface: None,
            plugin_port: None,
            acl: None,
            nameserver: Vec::new(),
            verbose: false,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::load_str(&content)
    }

    pub fn load_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::config("No upstream servers configured"));
        }

        self.local
            .parse::<SocketAddr>()
            .map_err(|_| Error::config(format!("Invalid local address: {}", self.local)))?;

        let kind = CipherKind::try_from(self.method.as_str())?;

        match (&self.password, &self.key) {
            (None, None) => {
                return Err(Error::config("Either password or key is required"));
            }
            (_, Some(key)) => {
                crate::crypto::parse_key(key, kind.key_len())?;
            }
            _ => {}
        }

        if self.timeout == 0 {
            return Err(Error::config("Timeout must be positive"));
        }

        MptcpMode::try_from(self.mptcp.as_str())?;

        if let Some(ref acl) = self.acl {
            AclMode::try_from(acl.mode.as_str())?;
        }

        Ok(())
    }

    pub fn cipher_kind(&self) -> Result<CipherKind> {
        CipherKind::try_from(self.method.as_str())
    }

    /// The configured master key: explicit key when present, otherwise
    /// derived from the password.
    pub fn master_key(&self) -> Result<Vec<u8>> {
        let kind = self.cipher_kind()?;
        if let Some(ref key) = self.key {
            return crate::crypto::parse_key(key, kind.key_len());
        }
        match self.password {
            Some(ref password) => Ok(crate::crypto::derive_key(password, kind.key_len())),
            None => Err(Error::config("Either password or key is required")),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.local
            .parse()
            .map_err(|_| Error::config(format!("Invalid local address: {}", self.local)))
    }

    pub fn mptcp_mode(&self) -> Result<MptcpMode> {
        MptcpMode::try_from(self.mptcp.as_str())
    }
}
