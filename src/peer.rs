use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A connectable peer endpoint. The host is guaranteed non-link-local by
/// every production site (discovery, cache load, registry parse, manual
/// input); [`PeerAddress::parse`] enforces it for external input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `HOST:PORT` or a bare `HOST` (falling back to `default_port`),
    /// rejecting link-local and scope-qualified addresses.
    pub fn parse(input: &str, default_port: u16) -> Result<Self, Error> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidAddress("empty address".to_string()));
        }

        // IPv6 literals contain ':' themselves, so only treat the suffix as
        // a port when the prefix is not itself colon-separated.
        let (host, port) = match input.rsplit_once(':') {
            Some((h, p)) if !h.is_empty() && !h.contains(':') => match p.parse::<u16>() {
                Ok(port) => (h.to_string(), port),
                Err(_) => return Err(Error::InvalidAddress(input.to_string())),
            },
            _ => (input.to_string(), default_port),
        };

        let addr = Self { host, port };
        if !addr.is_routable() {
            return Err(Error::InvalidAddress(input.to_string()));
        }
        Ok(addr)
    }

    /// False for link-local (`169.254.*`, `fe80::*`) and scope-qualified
    /// (`%`) hosts, which are unusable for a routed peer connection.
    pub fn is_routable(&self) -> bool {
        host_is_routable(&self.host)
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Link-local / scope filter applied wherever addresses are produced.
pub fn host_is_routable(host: &str) -> bool {
    if host.contains('%') || host.starts_with("169.254.") || host.starts_with("fe80:") {
        return false;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip_is_routable(ip);
    }
    // Hostnames pass; they resolve at connect time.
    true
}

pub fn ip_is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_link_local() && !v4.is_unspecified(),
        // fe80::/10
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80 && !v6.is_unspecified(),
    }
}

/// Which strategy produced a resolved address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoverySource {
    Cached,
    Manual,
    Local,
    Fallback,
    None,
}

impl DiscoverySource {
    pub fn label(&self) -> &'static str {
        match self {
            DiscoverySource::Cached => "cached",
            DiscoverySource::Manual => "manual",
            DiscoverySource::Local => "local discovery",
            DiscoverySource::Fallback => "fallback registry",
            DiscoverySource::None => "none",
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_link_local_and_scoped_hosts() {
        assert!(!host_is_routable("169.254.10.3"));
        assert!(!host_is_routable("fe80::1"));
        assert!(!host_is_routable("fe80::1%en0"));
        assert!(!host_is_routable("192.168.1.5%utun0"));
        assert!(host_is_routable("10.0.0.5"));
        assert!(host_is_routable("203.0.113.9"));
        assert!(host_is_routable("my-desktop.local"));
    }

    #[test]
    fn parse_accepts_host_port_and_bare_host() {
        let a = PeerAddress::parse("10.0.0.5:9000", 8888).unwrap();
        assert_eq!((a.host.as_str(), a.port), ("10.0.0.5", 9000));

        let b = PeerAddress::parse("10.0.0.5", 8888).unwrap();
        assert_eq!((b.host.as_str(), b.port), ("10.0.0.5", 8888));

        // IPv6 literal without a port keeps its colons.
        let c = PeerAddress::parse("2001:db8::7", 8888).unwrap();
        assert_eq!((c.host.as_str(), c.port), ("2001:db8::7", 8888));
    }

    #[test]
    fn parse_rejects_link_local() {
        assert!(PeerAddress::parse("169.254.1.2:8888", 8888).is_err());
        assert!(PeerAddress::parse("fe80::1", 8888).is_err());
        assert!(PeerAddress::parse("", 8888).is_err());
    }

    #[test]
    fn source_labels() {
        assert_eq!(DiscoverySource::Local.label(), "local discovery");
        assert_eq!(DiscoverySource::Fallback.to_string(), "fallback registry");
    }
}
