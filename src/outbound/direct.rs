//! Direct (bypass) connections.

use crate::common::net::{connect_remote, Address, ConnectOpts};
use crate::dns::Resolver;
use crate::Result;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::debug;

/// Connect straight to the target, resolving the hostname when needed.
/// Used for connections the ACL routes around the tunnel.
pub async fn dial_direct(
    resolver: &Resolver,
    target: &Address,
    port: u16,
    opts: &ConnectOpts,
) -> Result<TcpStream> {
    let addr: SocketAddr = match target.to_ip() {
        Some(ip) => SocketAddr::new(ip, port),
        None => resolver.resolve_socket(&target.to_host(), port).await?,
    };

    debug!("direct connect to {}", addr);
    connect_remote(addr, opts).await
}
