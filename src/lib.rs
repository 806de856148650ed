//! sslocal-rust - a Shadowsocks local proxy core.
//!
//! A SOCKS5 front-end that tunnels TCP (and optionally UDP) traffic through
//! AEAD-encrypted streams to configured upstream relays, with SNI/Host
//! sniffing, replay protection and bypass routing.
//!
//! # Architecture
//!
//! ```text
//!           +-----------+
//!           |  lib.rs   |  listener supervisor, signals
//!           +-----+-----+
//!                 |
//!        +--------+--------+
//!        |                 |
//! +------v------+   +------v------+
//! |  inbound/   |   |   config/   |
//! | socks5, udp |   +-------------+
//! +------+------+
//!        |
//! +------v------+     +-------------+
//! |   tunnel/   +-----> acl/, dns/  |
//! +------+------+     +-------------+
//!        |
//! +------v------+
//! |  outbound/  |  direct + shadowsocks (crypto/)
//! +-------------+
//! ```

pub mod acl;
pub mod common;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod inbound;
pub mod outbound;
pub mod tunnel;

pub use common::error::{Error, Result};
pub use config::Config;

use acl::{AclEngine, AclMode};
use common::net::{bind_tcp_listener, bind_udp_socket, ConnectOpts};
use crypto::ReplayCache;
use dns::Resolver;
use inbound::{Socks5Listener, UdpRelay};
use outbound::ShadowsocksOutbound;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tunnel::{ConnectionTracker, Tunnel};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cap on how long an outbound connect may take, independent of the idle
/// timeout.
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The local proxy: owns the tunnel, the listeners and the live-connection
/// registry. All fallible startup work happens in [`App::new`], so errors
/// are fatal before any socket exists.
#[derive(Debug)]
pub struct App {
    config: Config,
    outbound: Arc<ShadowsocksOutbound>,
    tunnel: Arc<Tunnel>,
    tracker: Arc<ConnectionTracker>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let kind = config.cipher_kind()?;
        let master_key = config.master_key()?;
        info!("cipher: {}", kind.name());

        let resolver = Arc::new(Resolver::new(&config.nameserver, config.ipv6_first)?);

        // A configured plugin takes over the network hop; the tunnel then
        // talks to it on loopback instead of the real relays.
        let servers: Vec<SocketAddr> = match config.plugin_port {
            Some(port) => vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)],
            None => {
                let mut resolved = Vec::with_capacity(config.servers.len());
                for server in &config.servers {
                    resolved.push(resolve_server(&resolver, server).await?);
                }
                resolved
            }
        };
        info!("{} upstream relay(s)", servers.len());

        let idle_timeout = Duration::from_secs(config.timeout);
        let opts = ConnectOpts {
            fast_open: config.fast_open,
            mptcp: config.mptcp_mode()?,
            interface: config.interface.clone(),
            connect_timeout: idle_timeout.min(MAX_CONNECT_TIMEOUT),
        };

        let replay = Arc::new(ReplayCache::default());
        let outbound = Arc::new(ShadowsocksOutbound::new(
            kind,
            master_key,
            servers,
            opts.clone(),
            replay,
        )?);

        let acl = match config.acl {
            Some(ref acl_config) => {
                let mode = AclMode::try_from(acl_config.mode.as_str())?;
                info!("ACL enabled ({:?})", mode);
                Some(AclEngine::new(mode, &acl_config.bypass, &acl_config.proxy)?)
            }
            None => None,
        };

        let tracker = ConnectionTracker::new();
        let tunnel = Arc::new(Tunnel::new(
            outbound.clone(),
            resolver,
            acl,
            opts,
            idle_timeout,
            tracker.clone(),
        ));

        Ok(App {
            config,
            outbound,
            tunnel,
            tracker,
        })
    }

    /// Bind the listeners and serve until a shutdown signal arrives.
    pub async fn run(&self) -> Result<()> {
        let local = self.config.local_addr()?;

        // The UDP relay binds first so SOCKS5 replies can advertise it.
        let udp_relay = if self.config.udp {
            let socket = bind_udp_socket(local, self.config.reuse_port)?;
            Some(UdpRelay::new(
                socket,
                self.outbound.clone(),
                Duration::from_secs(self.config.timeout),
                self.config.mtu,
            ))
        } else {
            None
        };
        let udp_bind = match udp_relay {
            Some(ref relay) => Some(relay.local_addr()?),
            None => None,
        };

        let listener = bind_tcp_listener(local, self.config.reuse_port)?;
        let socks = Socks5Listener::new(listener, self.tunnel.clone(), udp_bind);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(socks.run()));
        if let Some(relay) = udp_relay {
            tasks.push(tokio::spawn(relay.run()));
        }

        wait_for_signal().await?;

        // Stop accepting, then walk the live connections.
        for task in &tasks {
            task.abort();
        }
        self.tracker.shutdown();

        let (up, down) = self.tracker.totals();
        info!("shutdown complete (up {} B, down {} B)", up, down);
        Ok(())
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }
}

async fn resolve_server(resolver: &Resolver, server: &str) -> Result<SocketAddr> {
    if let Ok(addr) = server.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port) = server
        .rsplit_once(':')
        .ok_or_else(|| Error::config(format!("Invalid server address: {}", server)))?;
    let port: u16 = port
        .parse()
        .map_err(|_| Error::config(format!("Invalid server port: {}", server)))?;

    resolver
        .resolve_socket(host, port)
        .await
        .map_err(|e| Error::config(format!("Cannot resolve {}: {}", server, e)))
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        let mut usr1 = signal(SignalKind::user_defined1())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
            _ = usr1.recv() => info!("SIGUSR1 received, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            servers: vec!["127.0.0.1:8388".to_string()],
            password: Some("test".to_string()),
            nameserver: vec!["127.0.0.1".to_string()],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_app_from_minimal_config() {
        let app = App::new(base_config()).await.unwrap();
        assert!(!app.tunnel().has_acl());
        assert_eq!(app.tracker.live_count(), 0);
    }

    #[tokio::test]
    async fn test_plugin_port_overrides_servers() {
        let mut config = base_config();
        config.servers = vec!["relay.example:8388".to_string()];
        config.plugin_port = Some(7788);

        // The plugin address replaces the relay list entirely; the relay
        // hostname is never resolved.
        let app = App::new(config).await.unwrap();
        assert_eq!(
            app.outbound.pick_server(),
            "127.0.0.1:7788".parse().unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_cipher_is_fatal() {
        let mut config = base_config();
        config.method = "aes-256-cfb".to_string();
        let err = App::new(config).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!err.is_connection_scoped());
    }

    #[tokio::test]
    async fn test_acl_config_builds_engine() {
        let mut config = base_config();
        config.acl = Some(config::AclConfig {
            mode: "blacklist".to_string(),
            bypass: vec!["10.0.0.0/8".to_string()],
            proxy: Vec::new(),
        });
        let app = App::new(config).await.unwrap();
        assert!(app.tunnel().has_acl());
    }
}
