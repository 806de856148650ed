//! Bypass routing policy.
//!
//! The engine answers one question per connection: tunnel it, or connect
//! straight to the target. Hostname rules are definitive; IP rules apply
//! when no hostname rule matched; the mode supplies the default.

use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::HashSet;
use std::net::IpAddr;

/// Policy mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclMode {
    /// Default proxy; matches are sent direct.
    BlackList,
    /// Default direct; matches are proxied.
    WhiteList,
}

impl TryFrom<&str> for AclMode {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "blacklist" | "black-list" | "bypass_list" => Ok(AclMode::BlackList),
            "whitelist" | "white-list" | "proxy_list" => Ok(AclMode::WhiteList),
            _ => Err(Error::config(format!("Unknown ACL mode: {}", s))),
        }
    }
}

/// Tri-state rule verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Bypass,
    Proxy,
    NoMatch,
}

/// One rule list: exact domains, domain suffixes (leading dot) and CIDRs.
#[derive(Debug, Default)]
struct RuleSet {
    exact: HashSet<String>,
    suffixes: Vec<String>,
    networks: Vec<IpNet>,
}

impl RuleSet {
    fn parse(items: &[String]) -> Result<Self> {
        let mut set = RuleSet::default();

        for item in items {
            let item = item.trim();
            if item.is_empty() || item.starts_with('#') {
                continue;
            }

            if let Ok(net) = item.parse::<IpNet>() {
                set.networks.push(net);
            } else if let Ok(ip) = item.parse::<IpAddr>() {
                set.networks.push(IpNet::from(ip));
            } else if let Some(suffix) = item.strip_prefix("*.") {
                set.suffixes.push(format!(".{}", suffix.to_lowercase()));
            } else if item.starts_with('.') {
                set.suffixes.push(item.to_lowercase());
            } else if item.contains('/') {
                return Err(Error::config(format!("Invalid CIDR rule: {}", item)));
            } else {
                set.exact.insert(item.to_lowercase());
            }
        }

        Ok(set)
    }

    fn matches_host(&self, host: &str) -> bool {
        if self.exact.contains(host) {
            return true;
        }
        self.suffixes
            .iter()
            .any(|s| host.ends_with(s.as_str()) || host == &s[1..])
    }

    fn matches_ip(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&ip))
    }
}

/// The bypass oracle consumed by the tunnel.
#[derive(Debug)]
pub struct AclEngine {
    mode: AclMode,
    bypass: RuleSet,
    proxy: RuleSet,
}

impl AclEngine {
    pub fn new(mode: AclMode, bypass_rules: &[String], proxy_rules: &[String]) -> Result<Self> {
        Ok(AclEngine {
            mode,
            bypass: RuleSet::parse(bypass_rules)?,
            proxy: RuleSet::parse(proxy_rules)?,
        })
    }

    pub fn mode(&self) -> AclMode {
        self.mode
    }

    fn match_host(&self, host: &str) -> Verdict {
        let host = host.to_lowercase();
        if self.bypass.matches_host(&host) {
            Verdict::Bypass
        } else if self.proxy.matches_host(&host) {
            Verdict::Proxy
        } else {
            Verdict::NoMatch
        }
    }

    /// Decide routing for a target. `host` is the domain name when known
    /// (from the request or the sniffer); `ip` is the literal or resolved
    /// address when available. A hostname verdict is definitive; otherwise
    /// IP rules apply with the mode default.
    pub fn is_bypass(&self, host: Option<&str>, ip: Option<IpAddr>) -> bool {
        if let Some(host) = host.filter(|h| !h.is_empty()) {
            match self.match_host(host) {
                Verdict::Bypass => return true,
                Verdict::Proxy => return false,
                Verdict::NoMatch => {}
            }
        }

        match self.mode {
            AclMode::BlackList => ip.map_or(false, |ip| self.bypass.matches_ip(ip)),
            AclMode::WhiteList => !ip.map_or(false, |ip| self.proxy.matches_ip(ip)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(mode: AclMode, bypass: &[&str], proxy: &[&str]) -> AclEngine {
        AclEngine::new(
            mode,
            &bypass.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &proxy.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn test_blacklist_ip_cidr() {
        let acl = engine(AclMode::BlackList, &["10.0.0.0/8"], &[]);

        // Matching IPs go direct, everything else is proxied.
        assert!(acl.is_bypass(None, Some("10.1.2.3".parse().unwrap())));
        assert!(!acl.is_bypass(None, Some("8.8.8.8".parse().unwrap())));
        assert!(!acl.is_bypass(None, None));
    }

    #[test]
    fn test_whitelist_defaults_direct() {
        let acl = engine(AclMode::WhiteList, &[], &["192.0.2.0/24"]);

        assert!(!acl.is_bypass(None, Some("192.0.2.10".parse().unwrap())));
        assert!(acl.is_bypass(None, Some("8.8.8.8".parse().unwrap())));
        assert!(acl.is_bypass(None, None));
    }

    #[test]
    fn test_hostname_is_definitive() {
        // The host verdict wins even when the IP would say otherwise.
        let acl = engine(
            AclMode::BlackList,
            &["10.0.0.0/8"],
            &["internal.example.com"],
        );
        assert!(!acl.is_bypass(
            Some("internal.example.com"),
            Some("10.1.2.3".parse().unwrap())
        ));

        let acl = engine(AclMode::BlackList, &["cdn.example.com"], &[]);
        assert!(acl.is_bypass(Some("cdn.example.com"), Some("8.8.8.8".parse().unwrap())));
    }

    #[test]
    fn test_domain_suffix_rules() {
        let acl = engine(AclMode::BlackList, &["*.example.com", ".test.org"], &[]);

        assert!(acl.is_bypass(Some("www.example.com"), None));
        assert!(acl.is_bypass(Some("example.com"), None));
        assert!(acl.is_bypass(Some("a.b.test.org"), None));
        assert!(!acl.is_bypass(Some("example.org"), None));
        assert!(!acl.is_bypass(Some("notexample.com"), None));
    }

    #[test]
    fn test_exact_domain_case_insensitive() {
        let acl = engine(AclMode::BlackList, &["Example.COM"], &[]);
        assert!(acl.is_bypass(Some("example.com"), None));
        assert!(acl.is_bypass(Some("EXAMPLE.com"), None));
    }

    #[test]
    fn test_bare_ip_rule() {
        let acl = engine(AclMode::BlackList, &["192.168.1.1"], &[]);
        assert!(acl.is_bypass(None, Some("192.168.1.1".parse().unwrap())));
        assert!(!acl.is_bypass(None, Some("192.168.1.2".parse().unwrap())));
    }

    #[test]
    fn test_ipv6_cidr() {
        let acl = engine(AclMode::BlackList, &["fd00::/8"], &[]);
        assert!(acl.is_bypass(None, Some("fd12::1".parse().unwrap())));
        assert!(!acl.is_bypass(None, Some("2001:db8::1".parse().unwrap())));
    }

    #[test]
    fn test_comments_and_blanks_ignored() {
        let acl = engine(AclMode::BlackList, &["# comment", "", "10.0.0.0/8"], &[]);
        assert!(acl.is_bypass(None, Some("10.0.0.1".parse().unwrap())));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(AclMode::try_from("blacklist").unwrap(), AclMode::BlackList);
        assert_eq!(AclMode::try_from("whitelist").unwrap(), AclMode::WhiteList);
        assert!(AclMode::try_from("greylist").is_err());
    }
}
