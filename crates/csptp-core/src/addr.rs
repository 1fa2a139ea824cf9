//! Protocol-tagged endpoint addresses.
//!
//! The wire carries a network-protocol tag (1 = UDP/IPv4, 2 = UDP/IPv6) and
//! raw IP octets; the engines carry full endpoints. Resolution tries a
//! literal IP first and falls back to hostname lookup, never yielding the
//! any-address.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use crate::error::{Error, Result};

/// IANA-assigned PTP event port.
pub const PTP_EVENT_PORT: u16 = 320;

pub const IPV4_ADDR_LEN: usize = 4;
pub const IPV6_ADDR_LEN: usize = 16;

/// Network protocol tag as carried in the CSPTP_STATUS PortAddress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp4 = 1,
    Udp6 = 2,
}

impl Protocol {
    pub fn from_wire(v: u16) -> Option<Self> {
        match v {
            1 => Some(Protocol::Udp4),
            2 => Some(Protocol::Udp6),
            _ => None,
        }
    }

    /// Octet count of an address of this family.
    pub fn addr_len(&self) -> usize {
        match self {
            Protocol::Udp4 => IPV4_ADDR_LEN,
            Protocol::Udp6 => IPV6_ADDR_LEN,
        }
    }
}

/// UDP endpoint: protocol-tagged IP plus port. Equality compares protocol,
/// IP octets, and port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    ip: IpAddr,
    port: u16,
}

impl Address {
    /// Any-address endpoint of the given family on the PTP event port.
    pub fn any(proto: Protocol) -> Self {
        let ip = match proto {
            Protocol::Udp4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Protocol::Udp6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        Self { ip, port: PTP_EVENT_PORT }
    }

    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn proto(&self) -> Protocol {
        match self.ip {
            IpAddr::V4(_) => Protocol::Udp4,
            IpAddr::V6(_) => Protocol::Udp6,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    pub fn is_any_ip(&self) -> bool {
        match self.ip {
            IpAddr::V4(v4) => v4.is_unspecified(),
            IpAddr::V6(v6) => v6.is_unspecified(),
        }
    }

    /// Raw IP octets, network order (4 or 16 of them).
    pub fn ip_octets(&self) -> Vec<u8> {
        match self.ip {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    /// IPv4 address as a host-order integer (store hash input).
    pub fn v4_value(&self) -> Option<u32> {
        match self.ip {
            IpAddr::V4(v4) => Some(u32::from(v4)),
            IpAddr::V6(_) => None,
        }
    }

    /// Low 32 bits of an IPv6 address, host order (store hash input).
    pub fn v6_low32(&self) -> Option<u32> {
        match self.ip {
            IpAddr::V4(_) => None,
            IpAddr::V6(v6) => {
                let o = v6.octets();
                Some(u32::from_be_bytes([o[12], o[13], o[14], o[15]]))
            }
        }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn from_socket_addr(sa: SocketAddr) -> Self {
        Self { ip: sa.ip(), port: sa.port() }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

fn parse_literal(s: &str, forced: Option<Protocol>) -> Option<IpAddr> {
    match forced {
        Some(Protocol::Udp4) => s.parse::<Ipv4Addr>().ok().map(IpAddr::V4),
        Some(Protocol::Udp6) => s.parse::<Ipv6Addr>().ok().map(IpAddr::V6),
        // IPv6 literals always contain ':', IPv4 literals never do.
        None => {
            if s.contains(':') {
                s.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
            } else {
                s.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
            }
        }
    }
}

fn family_matches(ip: &IpAddr, forced: Option<Protocol>) -> bool {
    match (ip, forced) {
        (_, None) => true,
        (IpAddr::V4(_), Some(Protocol::Udp4)) => true,
        (IpAddr::V6(_), Some(Protocol::Udp6)) => true,
        _ => false,
    }
}

/// Turn an IP literal or hostname into an IP of the requested family.
///
/// A literal is tried first (family picked by the presence of ':' when not
/// forced). Otherwise the name is resolved and the first non-any result of a
/// matching family wins. The any-address is never returned.
pub fn resolve(s: &str, forced: Option<Protocol>) -> Result<IpAddr> {
    if s.is_empty() {
        return Err(Error::Contract("address string is empty"));
    }
    if let Some(ip) = parse_literal(s, forced) {
        if match ip {
            IpAddr::V4(v4) => v4.is_unspecified(),
            IpAddr::V6(v6) => v6.is_unspecified(),
        } {
            return Err(Error::Resolve(s.to_string()));
        }
        return Ok(ip);
    }
    // Hostname lookup. The port is irrelevant for resolution.
    let candidates = (s, 0u16)
        .to_socket_addrs()
        .map_err(|err| {
            tracing::error!(host = s, %err, "hostname resolution failed");
            Error::Resolve(s.to_string())
        })?;
    for sa in candidates {
        let ip = sa.ip();
        if family_matches(&ip, forced)
            && !match ip {
                IpAddr::V4(v4) => v4.is_unspecified(),
                IpAddr::V6(v6) => v6.is_unspecified(),
            }
        {
            return Ok(ip);
        }
    }
    tracing::warn!(host = s, "no usable address of the requested family");
    Err(Error::Resolve(s.to_string()))
}
