//! Socket addresses.
//!
//! [`SocketAddress`] is an immutable value: family/protocol, the raw OS
//! address bytes and an optional resolved hostname. It is constructed by
//! string parsing, by DNS resolution, or by copying a live peer/local
//! address, and never mutated afterwards.

use crate::base::neterror::NetError;
use socket2::{Domain, SockAddr};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Clone)]
pub struct SocketAddress {
    addr: SockAddr,
    protocol: Protocol,
    hostname: Option<String>,
}

impl SocketAddress {
    pub fn new(addr: SockAddr, protocol: Protocol, hostname: Option<String>) -> Self {
        Self { addr, protocol, hostname }
    }

    /// Parses an IP-literal host without touching DNS. Returns `None` for
    /// names that require resolution.
    pub fn try_parse(host: &str, port: u16, protocol: Protocol) -> Option<Self> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            let std_addr = SocketAddr::V4(SocketAddrV4::new(ip, port));
            return Some(Self::from_std(std_addr, protocol));
        }
        if let Ok(ip) = host.parse::<Ipv6Addr>() {
            let std_addr = SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0));
            return Some(Self::from_std(std_addr, protocol));
        }
        None
    }

    /// Parses a `host:port` string with an IP-literal host.
    pub fn parse(spec: &str, protocol: Protocol) -> Result<Self, NetError> {
        let std_addr: SocketAddr = spec
            .parse()
            .map_err(|_| NetError::AddressInvalid(spec.to_string()))?;
        Ok(Self::from_std(std_addr, protocol))
    }

    pub fn from_std(addr: SocketAddr, protocol: Protocol) -> Self {
        Self {
            addr: SockAddr::from(addr),
            protocol,
            hostname: None,
        }
    }

    /// Returns a copy carrying the hostname it was resolved from.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn raw(&self) -> &SockAddr {
        &self.addr
    }

    pub fn domain(&self) -> Domain {
        self.addr.domain()
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn as_socket(&self) -> Option<SocketAddr> {
        self.addr.as_socket()
    }

    pub fn port(&self) -> Option<u16> {
        self.as_socket().map(|a| a.port())
    }

    /// Stable identity string used to key the uplinks pool and DNS-adjacent
    /// bookkeeping: the concrete `ip:port`, independent of the hostname it
    /// was resolved from.
    pub fn identity(&self) -> String {
        match self.as_socket() {
            Some(std_addr) => std_addr.to_string(),
            None => format!("raw:{:?}", self.addr),
        }
    }
}

impl fmt::Debug for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketAddress")
            .field("addr", &self.identity())
            .field("protocol", &self.protocol)
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_parse_ipv4() {
        let addr = SocketAddress::try_parse("127.0.0.1", 8080, Protocol::Tcp).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), Some(8080));
        assert_eq!(addr.identity(), "127.0.0.1:8080");
    }

    #[test]
    fn test_try_parse_ipv6() {
        let addr = SocketAddress::try_parse("::1", 443, Protocol::Tcp).unwrap();
        assert!(!addr.is_ipv4());
        assert_eq!(addr.port(), Some(443));
    }

    #[test]
    fn test_try_parse_hostname_needs_resolution() {
        assert!(SocketAddress::try_parse("example.com", 80, Protocol::Tcp).is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            SocketAddress::parse("not an address", Protocol::Tcp),
            Err(NetError::AddressInvalid(_))
        ));
    }

    #[test]
    fn test_hostname_carried() {
        let addr = SocketAddress::try_parse("10.0.0.1", 80, Protocol::Tcp)
            .unwrap()
            .with_hostname("internal.host");
        assert_eq!(addr.hostname(), Some("internal.host"));
        // Identity stays the concrete address.
        assert_eq!(addr.identity(), "10.0.0.1:80");
    }
}
