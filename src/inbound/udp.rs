//! UDP relay with a per-client NAT table.

use crate::common::net::Address;
use crate::common::socks::UdpHeader;
use crate::crypto::{open_udp, seal_udp};
use crate::outbound::ShadowsocksOutbound;
use crate::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

const UDP_BUF_SIZE: usize = 65536;

/// IP + UDP header overhead counted against the configured MTU.
const UDP_OVERHEAD: usize = 28;

/// One NAT entry: a client sockaddr mapped to its own upstream socket.
struct UdpPeer {
    remote: UdpSocket,
    last_active: Mutex<Instant>,
}

impl UdpPeer {
    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.last_active.lock().elapsed()
    }
}

/// The local UDP relay: decodes SOCKS5 UDP requests, seals them for the
/// upstream, and forwards decrypted replies back to the client.
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    outbound: Arc<ShadowsocksOutbound>,
    peers: DashMap<SocketAddr, Arc<UdpPeer>>,
    timeout: Duration,
    mtu: usize,
}

impl UdpRelay {
    pub fn new(
        socket: UdpSocket,
        outbound: Arc<ShadowsocksOutbound>,
        timeout: Duration,
        mtu: usize,
    ) -> Arc<Self> {
        Arc::new(UdpRelay {
            socket: Arc::new(socket),
            outbound,
            peers: DashMap::new(),
            timeout,
            mtu,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub async fn run(self: Arc<Self>) {
        match self.socket.local_addr() {
            Ok(addr) => info!("UDP relay listening on {}", addr),
            Err(_) => {}
        }

        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(e) => {
                    warn!("UDP recv error: {}", e);
                    continue;
                }
            };

            if let Err(e) = Self::handle_client_datagram(&self, &buf[..len], src).await {
                debug!("UDP datagram from {} dropped: {}", src, e);
            }
        }
    }

    /// Client-to-upstream path: strip the SOCKS5 UDP header, prepend the
    /// tunnel address header, seal, send through the peer's socket.
    async fn handle_client_datagram(
        relay: &Arc<Self>,
        data: &[u8],
        src: SocketAddr,
    ) -> Result<()> {
        let (header, header_len) = UdpHeader::from_bytes(data)?;
        if header.frag != 0 {
            // Fragmented requests are dropped; no state is created.
            debug!("UDP fragment from {} dropped", src);
            return Ok(());
        }

        let mut plaintext = header.address.to_wire(header.port)?;
        plaintext.extend_from_slice(&data[header_len..]);

        let sealed = seal_udp(
            relay.outbound.kind(),
            relay.outbound.master_key(),
            &plaintext,
        )?;
        if sealed.len() + UDP_OVERHEAD > relay.mtu {
            debug!(
                "UDP datagram to {} is {} bytes, exceeds mtu {}",
                header.address.to_string_with_port(header.port),
                sealed.len() + UDP_OVERHEAD,
                relay.mtu
            );
        }

        let peer = match relay.peers.get(&src).map(|p| p.value().clone()) {
            Some(peer) => peer,
            None => Self::create_peer(relay, src).await?,
        };
        peer.touch();
        peer.remote.send(&sealed).await?;
        Ok(())
    }

    async fn create_peer(relay: &Arc<Self>, src: SocketAddr) -> Result<Arc<UdpPeer>> {
        let server = relay.outbound.pick_server();
        let bind: SocketAddr = if server.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let remote = UdpSocket::bind(bind).await?;
        remote.connect(server).await?;

        let peer = Arc::new(UdpPeer {
            remote,
            last_active: Mutex::new(Instant::now()),
        });
        relay.peers.insert(src, peer.clone());
        debug!("UDP peer {} -> {}", src, server);

        let task_relay = relay.clone();
        let looped = peer.clone();
        tokio::spawn(async move {
            task_relay.peer_loop(src, looped).await;
        });

        Ok(peer)
    }

    /// Upstream-to-client path, one task per peer. The recv timeout doubles
    /// as the idle eviction timer.
    async fn peer_loop(self: Arc<Self>, client: SocketAddr, peer: Arc<UdpPeer>) {
        let mut buf = vec![0u8; UDP_BUF_SIZE];
        loop {
            match tokio::time::timeout(self.timeout, peer.remote.recv(&mut buf)).await {
                Err(_) => {
                    if peer.idle() >= self.timeout {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    debug!("UDP peer {} recv error: {}", client, e);
                    break;
                }
                Ok(Ok(len)) => {
                    peer.touch();
                    if let Err(e) = self.forward_reply(client, &buf[..len]).await {
                        debug!("UDP reply to {} dropped: {}", client, e);
                    }
                }
            }
        }

        self.peers.remove(&client);
        debug!("UDP peer {} expired", client);
    }

    async fn forward_reply(&self, client: SocketAddr, datagram: &[u8]) -> Result<()> {
        let plaintext = open_udp(
            self.outbound.kind(),
            self.outbound.master_key(),
            datagram,
            self.outbound.replay(),
        )?;

        let (address, port, used) = Address::decode(&plaintext)?;
        let mut reply = UdpHeader {
            frag: 0,
            address,
            port,
        }
        .to_bytes()?;
        reply.extend_from_slice(&plaintext[used..]);

        self.socket.send_to(&reply, client).await?;
        Ok(())
    }
}
