//! Trusted-proxy validation
//!
//! Forwarding headers (`X-Forwarded-*`, RFC 7239 `Forwarded`) are only
//! honored when the socket peer is a configured trusted proxy. Entries
//! are exact IP literals or CIDR blocks, IPv4 or IPv6. Hostnames are
//! never resolved; a malformed entry is logged and skipped.

use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

use crate::config::TrustedProxyConfig;

/// One allowed peer range
#[derive(Debug, Clone)]
enum IpRange {
    Single(IpAddr),
    Cidr(IpNet),
}

impl IpRange {
    fn contains(&self, ip: IpAddr) -> bool {
        match self {
            IpRange::Single(allowed) => allowed == &ip,
            IpRange::Cidr(network) => network.contains(&ip),
        }
    }
}

impl FromStr for IpRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Try parsing as CIDR first
        if let Ok(network) = IpNet::from_str(s) {
            return Ok(IpRange::Cidr(network));
        }
        if let Ok(ip) = IpAddr::from_str(s) {
            return Ok(IpRange::Single(ip));
        }
        Err(format!("invalid IP address or CIDR: {}", s))
    }
}

/// Decides whether forwarding headers from a given peer may be trusted
#[derive(Debug, Clone)]
pub struct TrustedProxies {
    enabled: bool,
    ranges: Vec<IpRange>,
}

impl TrustedProxies {
    /// Compile the configured proxy list
    ///
    /// Invalid entries are skipped with a warning rather than failing
    /// startup.
    pub fn new(config: &TrustedProxyConfig) -> Self {
        let mut ranges = Vec::new();
        for entry in &config.proxies {
            match IpRange::from_str(entry.trim()) {
                Ok(range) => ranges.push(range),
                Err(reason) => {
                    tracing::warn!("Ignoring trusted proxy entry '{}': {}", entry, reason);
                }
            }
        }
        Self {
            enabled: config.enabled,
            ranges,
        }
    }

    /// Trust-everything validator (validation disabled)
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ranges: Vec::new(),
        }
    }

    /// Whether forwarding headers from this peer may be trusted
    ///
    /// A disabled configuration trusts all peers.
    pub fn is_trusted(&self, peer: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        self.ranges.iter().any(|range| range.contains(peer))
    }

    /// Trust decision when the peer address may be unknown
    ///
    /// With validation enabled an unknown peer is never trusted.
    pub fn is_trusted_peer(&self, peer: Option<IpAddr>) -> bool {
        match peer {
            Some(ip) => self.is_trusted(ip),
            None => !self.enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, proxies: &[&str]) -> TrustedProxyConfig {
        TrustedProxyConfig {
            enabled,
            proxies: proxies.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_disabled_trusts_all() {
        let proxies = TrustedProxies::new(&config(false, &[]));
        assert!(proxies.is_trusted("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_exact_ip() {
        let proxies = TrustedProxies::new(&config(true, &["10.0.0.1"]));
        assert!(proxies.is_trusted("10.0.0.1".parse().unwrap()));
        assert!(!proxies.is_trusted("10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_cidr_v4() {
        let proxies = TrustedProxies::new(&config(true, &["10.0.0.0/8"]));
        assert!(proxies.is_trusted("10.200.3.4".parse().unwrap()));
        assert!(!proxies.is_trusted("11.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_cidr_v6() {
        let proxies = TrustedProxies::new(&config(true, &["fd00::/8"]));
        assert!(proxies.is_trusted("fd12::1".parse().unwrap()));
        assert!(!proxies.is_trusted("fe80::1".parse().unwrap()));
    }

    #[test]
    fn test_cross_family_never_matches() {
        let proxies = TrustedProxies::new(&config(true, &["10.0.0.0/8"]));
        // An IPv6-mapped form of an in-range IPv4 address is still IPv6
        assert!(!proxies.is_trusted("::ffff:10.0.0.1".parse::<IpAddr>().unwrap()));
        assert!(!proxies.is_trusted("fd00::1".parse().unwrap()));
    }

    #[test]
    fn test_malformed_entries_skipped() {
        let proxies = TrustedProxies::new(&config(true, &["proxy.internal", "10.0.0.0/40", "10.0.0.1"]));
        // Hostnames and bad prefixes are ignored; the valid literal still applies
        assert!(proxies.is_trusted("10.0.0.1".parse().unwrap()));
        assert!(!proxies.is_trusted("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_empty_enabled_list_trusts_none() {
        let proxies = TrustedProxies::new(&config(true, &[]));
        assert!(!proxies.is_trusted("127.0.0.1".parse().unwrap()));
    }
}
