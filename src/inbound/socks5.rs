//! SOCKS5 proxy inbound

use crate::common::net::{configure_tcp_stream, Address};
use crate::common::sniff::{sniff, SniffResult, HTTP_PORT, SNIFF_BUF_SIZE, TLS_PORT};
use crate::common::socks::{
    AuthRequest, AuthResponse, Command, Request, Response, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH,
    REP_COMMAND_NOT_SUPPORTED,
};
use crate::tunnel::Tunnel;
use crate::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info};

/// How long additional client bytes may trickle in before the outbound
/// connect is committed. This is the window the sniffer works in.
const DELAYED_CONNECT_MS: u64 = 50;

/// SOCKS5 listener: accepts clients and spawns one tracked task each.
pub struct Socks5Listener {
    listener: TcpListener,
    tunnel: Arc<Tunnel>,
    udp_bind: Option<SocketAddr>,
}

impl Socks5Listener {
    pub fn new(listener: TcpListener, tunnel: Arc<Tunnel>, udp_bind: Option<SocketAddr>) -> Self {
        Socks5Listener {
            listener,
            tunnel,
            udp_bind,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) {
        info!(
            "SOCKS5 listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default()
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    configure_tcp_stream(&stream);
                    let tunnel = self.tunnel.clone();
                    let udp_bind = self.udp_bind;
                    self.tunnel.tracker().clone().spawn_tracked(async move {
                        handle_connection(tunnel, stream, peer, udp_bind).await;
                    });
                }
                Err(e) => {
                    error!("accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(
    tunnel: Arc<Tunnel>,
    mut stream: TcpStream,
    peer: SocketAddr,
    udp_bind: Option<SocketAddr>,
) {
    if let Err(e) = process_connection(&tunnel, &mut stream, peer, udp_bind).await {
        // Frame failures were already reported by the tunnel.
        if !e.is_invalid_frame() {
            debug!("SOCKS5 connection from {}: {}", peer, e);
        }
    }
}

async fn process_connection(
    tunnel: &Tunnel,
    stream: &mut TcpStream,
    peer: SocketAddr,
    udp_bind: Option<SocketAddr>,
) -> Result<()> {
    // Method selection; only NO-AUTH is offered.
    let auth = AuthRequest::read_from(stream).await?;
    if !auth.supports(AUTH_NO_AUTH) {
        AuthResponse::new(AUTH_NO_ACCEPTABLE)
            .write_to(stream)
            .await?;
        return Err(Error::protocol("no acceptable authentication method"));
    }
    AuthResponse::new(AUTH_NO_AUTH).write_to(stream).await?;

    let request = Request::read_from(stream).await?;
    match request.command {
        Command::Connect => {
            handle_connect(
                tunnel,
                stream,
                peer,
                request.address,
                request.port,
                udp_bind,
            )
            .await
        }
        Command::UdpAssociate => handle_udp_associate(stream, peer, udp_bind).await,
        Command::Bind => {
            Response::failure(REP_COMMAND_NOT_SUPPORTED)
                .write_to(stream)
                .await?;
            Err(Error::unsupported("BIND not supported"))
        }
    }
}

async fn handle_connect(
    tunnel: &Tunnel,
    stream: &mut TcpStream,
    peer: SocketAddr,
    address: Address,
    port: u16,
    udp_bind: Option<SocketAddr>,
) -> Result<()> {
    debug!(
        "SOCKS5 CONNECT {} -> {}",
        peer,
        address.to_string_with_port(port)
    );

    // The success reply is fabricated before the outbound connect; a
    // failed connect then simply closes the stream. BND carries the UDP
    // bind when UDP is offered, zeros otherwise.
    let reply = match udp_bind {
        Some(addr) => Response::success(Address::from(addr.ip()), addr.port()),
        None => Response::success(Address::Ipv4(Ipv4Addr::UNSPECIFIED), 0),
    };
    reply.write_to(stream).await?;

    let (target, carried) = parse_stage(tunnel, stream, address, port).await?;
    tunnel
        .relay_tcp(stream, &target, port, &carried, peer)
        .await?;
    Ok(())
}

/// The parse stage: for IP targets on sniffable ports, hold the outbound
/// connect briefly and try to recover a hostname from the first payload
/// bytes. Everything read here is carried over into the relay.
async fn parse_stage(
    tunnel: &Tunnel,
    stream: &mut TcpStream,
    address: Address,
    port: u16,
) -> Result<(Address, Vec<u8>)> {
    let sniffable = port == HTTP_PORT || port == TLS_PORT;
    if !tunnel.has_acl() || !sniffable || address.to_ip().is_none() {
        return Ok((address, Vec::new()));
    }

    let mut buf: Vec<u8> = Vec::with_capacity(2048);
    let deadline = Instant::now() + Duration::from_millis(DELAYED_CONNECT_MS);

    loop {
        let mut chunk = [0u8; 4096];
        let n = match timeout_at(deadline, stream.read(&mut chunk)).await {
            Err(_) => break, // window closed, connect now
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
        };
        buf.extend_from_slice(&chunk[..n]);

        match sniff(&buf, port) {
            SniffResult::Found(host) => {
                debug!("sniffed hostname {} for {}", host, address.to_host());
                return Ok((Address::Domain(host), buf));
            }
            SniffResult::NeedMore if buf.len() < SNIFF_BUF_SIZE => continue,
            _ => break,
        }
    }

    Ok((address, buf))
}

async fn handle_udp_associate(
    stream: &mut TcpStream,
    peer: SocketAddr,
    udp_bind: Option<SocketAddr>,
) -> Result<()> {
    let bind = match udp_bind {
        Some(addr) => addr,
        None => {
            Response::failure(REP_COMMAND_NOT_SUPPORTED)
                .write_to(stream)
                .await?;
            return Err(Error::unsupported("UDP relay not enabled"));
        }
    };

    debug!("SOCKS5 UDP ASSOCIATE from {}", peer);
    Response::success(Address::from(bind.ip()), bind.port())
        .write_to(stream)
        .await?;

    // The association lives as long as this TCP connection; hold it open
    // until the client closes.
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    debug!("SOCKS5 UDP ASSOCIATE from {} closed", peer);
    Ok(())
}
