//! Routing core: bypass decisions, upstream dialing and connection
//! bookkeeping.

use crate::acl::AclEngine;
use crate::common::buffer::relay_with_timeout;
use crate::common::net::{Address, ConnectOpts};
use crate::dns::Resolver;
use crate::outbound::{dial_direct, ShadowsocksOutbound};
use crate::{Error, Result};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Live-connection registry. Every relayed connection registers an abort
/// handle here so shutdown can walk the set and tear each one down.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    next_id: AtomicU64,
    live: DashMap<u64, AbortHandle>,
    upload: AtomicU64,
    download: AtomicU64,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn `fut` as a tracked connection task.
    pub fn spawn_tracked<F>(self: Arc<Self>, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tracker = self.clone();
        let handle = tokio::spawn(async move {
            fut.await;
            tracker.live.remove(&id);
        });
        let abort = handle.abort_handle();
        self.live.insert(id, abort);
        // The task may have finished between spawn and insert.
        if handle.is_finished() {
            self.live.remove(&id);
        }
    }

    pub fn add_traffic(&self, up: u64, down: u64) {
        self.upload.fetch_add(up, Ordering::Relaxed);
        self.download.fetch_add(down, Ordering::Relaxed);
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.upload.load(Ordering::Relaxed),
            self.download.load(Ordering::Relaxed),
        )
    }

    /// Abort every live connection. Dropping a task closes both of its
    /// sockets and releases its cipher contexts.
    pub fn shutdown(&self) {
        let mut aborted = 0usize;
        for entry in self.live.iter() {
            entry.value().abort();
            aborted += 1;
        }
        self.live.clear();
        if aborted > 0 {
            info!("aborted {} live connections", aborted);
        }
    }
}

/// Per-connection routing and relay.
#[derive(Debug)]
pub struct Tunnel {
    outbound: Arc<ShadowsocksOutbound>,
    resolver: Arc<Resolver>,
    acl: Option<AclEngine>,
    direct_opts: ConnectOpts,
    idle_timeout: Duration,
    tracker: Arc<ConnectionTracker>,
}

impl Tunnel {
    pub fn new(
        outbound: Arc<ShadowsocksOutbound>,
        resolver: Arc<Resolver>,
        acl: Option<AclEngine>,
        direct_opts: ConnectOpts,
        idle_timeout: Duration,
        tracker: Arc<ConnectionTracker>,
    ) -> Self {
        Tunnel {
            outbound,
            resolver,
            acl,
            direct_opts,
            idle_timeout,
            tracker,
        }
    }

    pub fn has_acl(&self) -> bool {
        self.acl.is_some()
    }

    pub fn outbound(&self) -> &Arc<ShadowsocksOutbound> {
        &self.outbound
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    /// Decide whether this target is routed around the tunnel.
    async fn is_bypass(&self, target: &Address) -> bool {
        let acl = match self.acl {
            Some(ref acl) => acl,
            None => return false,
        };

        let host = match target {
            Address::Domain(d) => Some(d.as_str()),
            _ => None,
        };

        // Resolve domains so CIDR rules can weigh in; resolution failure
        // just leaves the IP unknown.
        let ip = match target.to_ip() {
            Some(ip) => Some(ip),
            None => match host {
                Some(h) => self.resolver.resolve(h).await.ok(),
                None => None,
            },
        };

        acl.is_bypass(host, ip)
    }

    /// Relay an accepted SOCKS5 CONNECT. `initial` is client payload read
    /// during the sniff stage, forwarded ahead of anything else.
    pub async fn relay_tcp(
        &self,
        client: &mut TcpStream,
        target: &Address,
        port: u16,
        initial: &[u8],
        peer: SocketAddr,
    ) -> Result<(u64, u64)> {
        let result = if self.is_bypass(target).await {
            debug!("{} bypass {}", peer, target.to_string_with_port(port));
            let mut remote = dial_direct(&self.resolver, target, port, &self.direct_opts).await?;
            relay_with_timeout(client, &mut remote, initial, self.idle_timeout).await
        } else {
            debug!("{} connect {}", peer, target.to_string_with_port(port));
            let mut remote = self.outbound.dial(target, port, initial).await?;
            relay_with_timeout(client, &mut remote, b"", self.idle_timeout).await
        };

        match result {
            Ok((up, down)) => {
                self.tracker.add_traffic(up, down);
                debug!(
                    "{} closed {} (up {} B, down {} B)",
                    peer,
                    target.to_string_with_port(port),
                    up,
                    down
                );
                Ok((up, down))
            }
            Err(e) => {
                if e.is_invalid_frame() {
                    error!("invalid password or cipher");
                } else {
                    match e {
                        Error::Timeout(_) => {
                            debug!("{} timeout {}", peer, target.to_string_with_port(port))
                        }
                        ref other => warn!(
                            "{} relay error for {}: {}",
                            peer,
                            target.to_string_with_port(port),
                            other
                        ),
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracker_counts_and_shutdown() {
        let tracker = ConnectionTracker::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        tracker.clone().spawn_tracked(async move {
            let _ = rx.await;
        });

        // Let the spawn settle.
        tokio::task::yield_now().await;
        assert_eq!(tracker.live_count(), 1);

        tracker.shutdown();
        tokio::task::yield_now().await;
        assert_eq!(tracker.live_count(), 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_tracker_removes_finished() {
        let tracker = ConnectionTracker::new();
        tracker.clone().spawn_tracked(async {});

        // Give the task a moment to complete and unregister.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(tracker.live_count(), 0);
    }

    #[test]
    fn test_traffic_totals() {
        let tracker = ConnectionTracker::default();
        tracker.add_traffic(100, 200);
        tracker.add_traffic(1, 2);
        assert_eq!(tracker.totals(), (101, 202));
    }
}
