//! Target-host resolution for direct (bypassed) connections and ACL
//! IP matching.

use crate::{Error, Result};
use hickory_resolver::config::{
    LookupIpStrategy, NameServerConfig, Protocol, ResolverConfig, ResolverOpts,
};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

pub struct Resolver {
    resolver: TokioAsyncResolver,
    ipv6_first: bool,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("ipv6_first", &self.ipv6_first)
            .finish()
    }
}

impl Resolver {
    /// Build from a nameserver list; an empty list uses the system
    /// configuration.
    pub fn new(nameservers: &[String], ipv6_first: bool) -> Result<Self> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(5);
        opts.attempts = 2;
        opts.ip_strategy = if ipv6_first {
            LookupIpStrategy::Ipv6thenIpv4
        } else {
            LookupIpStrategy::Ipv4thenIpv6
        };

        let resolver = if nameservers.is_empty() {
            TokioAsyncResolver::tokio_from_system_conf()
                .map_err(|e| Error::dns(format!("system resolver: {}", e)))?
        } else {
            let mut config = ResolverConfig::new();
            for ns in nameservers {
                let addr: SocketAddr = if ns.contains(':') && ns.parse::<SocketAddr>().is_ok() {
                    ns.parse().unwrap()
                } else {
                    format!("{}:53", ns)
                        .parse()
                        .map_err(|_| Error::config(format!("Invalid nameserver: {}", ns)))?
                };
                config.add_name_server(NameServerConfig {
                    socket_addr: addr,
                    protocol: Protocol::Udp,
                    tls_dns_name: None,
                    trust_negative_responses: true,
                    bind_addr: None,
                });
            }
            TokioAsyncResolver::tokio(config, opts.clone())
        };

        Ok(Resolver {
            resolver,
            ipv6_first,
        })
    }

    /// Resolve a hostname to one address, honoring the family preference.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let lookup = self
            .resolver
            .lookup_ip(host)
            .await
            .map_err(|e| Error::dns(format!("{}: {}", host, e)))?;

        let preferred = if self.ipv6_first {
            lookup
                .iter()
                .find(|ip| ip.is_ipv6())
                .or_else(|| lookup.iter().next())
        } else {
            lookup
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| lookup.iter().next())
        };

        let ip = preferred.ok_or_else(|| Error::dns(format!("{}: no records", host)))?;
        debug!("resolved {} -> {}", host, ip);
        Ok(ip)
    }

    /// Resolve host and port into a connectable socket address.
    pub async fn resolve_socket(&self, host: &str, port: u16) -> Result<SocketAddr> {
        Ok(SocketAddr::new(self.resolve(host).await?, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_ip_short_circuits() {
        let resolver = Resolver::new(&["192.0.2.53".to_string()], false).unwrap();
        let ip = resolver.resolve("127.0.0.1").await.unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());

        let addr = resolver.resolve_socket("::1", 8080).await.unwrap();
        assert_eq!(addr.port(), 8080);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_invalid_nameserver_rejected() {
        assert!(Resolver::new(&["not a nameserver".to_string()], false).is_err());
    }
}
