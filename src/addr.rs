//! Target addresses and peer identities.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The address a proxy request wants to reach.
///
/// The parser picks the narrowest variant that fits: a numeric IPv4 host
/// becomes `Ipv4`, a numeric IPv6 host becomes `Ipv6`, anything else is kept
/// as a domain name and resolved by whoever finally dials it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 endpoint
    Ipv4(Ipv4Addr, u16),
    /// IPv6 endpoint
    Ipv6(Ipv6Addr, u16),
    /// Named endpoint, resolved at dial time
    Domain(String, u16),
}

impl Address {
    /// Parse a `host:port` string. The port may be a numeric value or a
    /// symbolic TCP service name from the platform services database.
    pub fn parse(s: &str) -> Result<Self> {
        let (host, port_str) = split_host_port(s)?;
        let port = match port_str.parse::<u16>() {
            Ok(p) => p,
            Err(_) => lookup_service(port_str)
                .ok_or_else(|| Error::addr(format!("unknown service name: {port_str}")))?,
        };

        if let Ok(ip) = host.parse::<IpAddr>() {
            Ok(Address::from_ip(ip, port))
        } else if host.is_empty() {
            Err(Error::addr(format!("empty host in address: {s}")))
        } else {
            Ok(Address::Domain(host.to_string(), port))
        }
    }

    /// Build an address from an IP and port, preferring the narrow variant.
    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        match ip {
            IpAddr::V4(v4) => Address::Ipv4(v4, port),
            IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
                Some(v4) => Address::Ipv4(v4, port),
                None => Address::Ipv6(v6, port),
            },
        }
    }

    /// The port component.
    pub fn port(&self) -> u16 {
        match self {
            Address::Ipv4(_, p) | Address::Ipv6(_, p) | Address::Domain(_, p) => *p,
        }
    }

    /// The IP component, if this address is numeric.
    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ipv4(ip, _) => Some(IpAddr::V4(*ip)),
            Address::Ipv6(ip, _) => Some(IpAddr::V6(*ip)),
            Address::Domain(..) => None,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(sa: SocketAddr) -> Self {
        Address::from_ip(sa.ip(), sa.port())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => write!(f, "{ip}:{port}"),
            Address::Ipv6(ip, port) => write!(f, "[{ip}]:{port}"),
            Address::Domain(name, port) => write!(f, "{name}:{port}"),
        }
    }
}

fn split_host_port(s: &str) -> Result<(&str, &str)> {
    if let Some(rest) = s.strip_prefix('[') {
        // bracketed IPv6 literal
        let close = rest
            .find(']')
            .ok_or_else(|| Error::addr(format!("unclosed bracket in address: {s}")))?;
        let host = &rest[..close];
        let tail = &rest[close + 1..];
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| Error::addr(format!("missing port in address: {s}")))?;
        Ok((host, port))
    } else {
        let colon = s
            .rfind(':')
            .ok_or_else(|| Error::addr(format!("missing port in address: {s}")))?;
        if s[..colon].contains(':') {
            return Err(Error::addr(format!(
                "IPv6 address must be bracketed: {s}"
            )));
        }
        Ok((&s[..colon], &s[colon + 1..]))
    }
}

/// Resolve a symbolic service name to a TCP port for the handful of
/// services a proxy target plausibly names.
fn lookup_service(name: &str) -> Option<u16> {
    match name.to_ascii_lowercase().as_str() {
        "ftp" => Some(21),
        "ssh" => Some(22),
        "telnet" => Some(23),
        "smtp" => Some(25),
        "domain" | "dns" => Some(53),
        "http" | "www" => Some(80),
        "pop3" => Some(110),
        "imap" => Some(143),
        "https" => Some(443),
        "socks" => Some(1080),
        _ => None,
    }
}

/// Identity of an authenticated counterparty, attached to a connection.
///
/// TLS-derived identifiers use scope `transport.tls` with the hex SHA-1 of
/// the DER certificate as the unique id; SOCKS5-authenticated users use
/// scope `proxy.socks5` with the username.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentifier {
    /// Namespace of the identity (`transport.tls`, `proxy.socks5`, ...)
    pub scope: String,
    /// Stable unique id within the scope
    pub unique_id: String,
    /// Human-readable name, may be empty
    pub name: String,
    /// Additional scope-specific attributes
    pub extra: BTreeMap<String, String>,
}

impl PeerIdentifier {
    /// Identifier scope used by the TLS transport.
    pub const SCOPE_TLS: &'static str = "transport.tls";
    /// Identifier scope used by SOCKS5 user authentication.
    pub const SCOPE_SOCKS5: &'static str = "proxy.socks5";

    /// Build an identifier with no extra attributes.
    pub fn new(scope: impl Into<String>, unique_id: impl Into<String>) -> Self {
        PeerIdentifier {
            scope: scope.into(),
            unique_id: unique_id.into(),
            name: String::new(),
            extra: BTreeMap::new(),
        }
    }
}

impl fmt::Display for PeerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.is_empty() {
            write!(f, "{}:{}", self.scope, self.unique_id)
        } else {
            write!(f, "{}:{} ({})", self.scope, self.unique_id, self.name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let addr = Address::parse("192.168.1.1:8080").unwrap();
        assert_eq!(addr, Address::Ipv4(Ipv4Addr::new(192, 168, 1, 1), 8080));
        assert_eq!(addr.to_string(), "192.168.1.1:8080");
    }

    #[test]
    fn test_parse_ipv6() {
        let addr = Address::parse("[2001:db8::1]:443").unwrap();
        assert!(matches!(addr, Address::Ipv6(_, 443)));
        assert_eq!(addr.to_string(), "[2001:db8::1]:443");
    }

    #[test]
    fn test_parse_domain() {
        let addr = Address::parse("example.com:80").unwrap();
        assert_eq!(addr, Address::Domain("example.com".into(), 80));
    }

    #[test]
    fn test_parse_service_name() {
        let addr = Address::parse("example.com:https").unwrap();
        assert_eq!(addr.port(), 443);
        assert!(Address::parse("example.com:nosuchservice").is_err());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(Address::parse("no-port").is_err());
        assert!(Address::parse(":1234").is_err());
        assert!(Address::parse("[::1:80").is_err());
        assert!(Address::parse("2001:db8::1:80").is_err());
    }

    #[test]
    fn test_mapped_ipv4_narrows() {
        let v6 = "::ffff:10.0.0.1".parse::<Ipv6Addr>().unwrap();
        let addr = Address::from_ip(IpAddr::V6(v6), 80);
        assert_eq!(addr, Address::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 80));
    }

    #[test]
    fn test_from_socket_addr() {
        let sa: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(
            Address::from(sa),
            Address::Ipv4(Ipv4Addr::LOCALHOST, 9000)
        );
    }
}
