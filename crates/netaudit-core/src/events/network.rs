//! Network events

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Raw `AF_INET` value
pub const AF_INET: u16 = 2;
/// Raw `AF_INET6` value
pub const AF_INET6: u16 = 10;

/// Raw `IPPROTO_TCP` value
pub const IPPROTO_TCP: u8 = 6;
/// Raw `IPPROTO_UDP` value
pub const IPPROTO_UDP: u8 = 17;

/// Size of an address slot in a stored record (large enough for IPv6)
pub const ADDR_SLOT_LEN: usize = 16;

/// Transport protocol of an audited socket
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp = IPPROTO_TCP,
    Udp = IPPROTO_UDP,
}

impl Protocol {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            IPPROTO_TCP => Some(Protocol::Tcp),
            IPPROTO_UDP => Some(Protocol::Udp),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        }
    }
}

/// Socket operation that produced an event
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Connect = 1,
    Accept = 2,
    Bind = 3,
    Close = 4,
}

impl Action {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Action::Connect),
            2 => Some(Action::Accept),
            3 => Some(Action::Bind),
            4 => Some(Action::Close),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Connect => "CONNECT",
            Action::Accept => "ACCEPT",
            Action::Bind => "BIND",
            Action::Close => "CLOSE",
        }
    }
}

/// Address family of an audited socket. Only the inet families are audited.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Inet = AF_INET,
    Inet6 = AF_INET6,
}

impl AddressFamily {
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            AF_INET => Some(AddressFamily::Inet),
            AF_INET6 => Some(AddressFamily::Inet6),
            _ => None,
        }
    }

    /// Suffix appended to the protocol name when rendering (`TCPv4`)
    pub fn suffix(&self) -> &'static str {
        match self {
            AddressFamily::Inet => "v4",
            AddressFamily::Inet6 => "v6",
        }
    }

    /// The unspecified address of this family
    pub fn unspecified(&self) -> IpAddr {
        match self {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

/// Address and port of one side of a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Unspecified address with port zero: "nothing known about this side"
    pub fn unspecified(family: AddressFamily) -> Self {
        Self {
            addr: family.unspecified(),
            port: 0,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        self.port == 0 && self.addr.is_unspecified()
    }

    /// Encode the address into a fixed 16-byte slot. IPv4 uses the first
    /// four bytes, the rest stays zero.
    pub fn addr_slot(&self) -> [u8; ADDR_SLOT_LEN] {
        let mut slot = [0u8; ADDR_SLOT_LEN];
        match self.addr {
            IpAddr::V4(v4) => slot[..4].copy_from_slice(&v4.octets()),
            IpAddr::V6(v6) => slot.copy_from_slice(&v6.octets()),
        }
        slot
    }

    /// Decode an address slot written by [`Endpoint::addr_slot`]
    pub fn from_slot(family: AddressFamily, slot: &[u8; ADDR_SLOT_LEN], port: u16) -> Self {
        let addr = match family {
            AddressFamily::Inet => IpAddr::V4(Ipv4Addr::new(slot[0], slot[1], slot[2], slot[3])),
            AddressFamily::Inet6 => IpAddr::V6(Ipv6Addr::from(*slot)),
        };
        Self { addr, port }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            addr: addr.ip(),
            port: addr.port(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr brackets IPv6 addresses
        SocketAddr::new(self.addr, self.port).fmt(f)
    }
}

/// A classified socket operation, ready to be recorded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkEvent {
    /// Executable of the process that performed the operation
    pub path: String,
    pub action: Action,
    pub protocol: Protocol,
    pub family: AddressFamily,
    /// Local side
    pub src: Endpoint,
    /// Remote side; unspecified when no peer is known (bind, unconnected UDP)
    pub dst: Endpoint,
}

impl NetworkEvent {
    /// Remote side, if one is known
    pub fn destination(&self) -> Option<&Endpoint> {
        if self.dst.is_unspecified() {
            None
        } else {
            Some(&self.dst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_slot_uses_leading_bytes() {
        let ep = Endpoint::new("93.184.216.34".parse().unwrap(), 443);
        let slot = ep.addr_slot();
        assert_eq!(&slot[..4], &[93, 184, 216, 34]);
        assert!(slot[4..].iter().all(|&b| b == 0));
        assert_eq!(Endpoint::from_slot(AddressFamily::Inet, &slot, 443), ep);
    }

    #[test]
    fn test_ipv6_slot() {
        let ep = Endpoint::new("2001:db8::1".parse().unwrap(), 8443);
        let slot = ep.addr_slot();
        assert_eq!(Endpoint::from_slot(AddressFamily::Inet6, &slot, 8443), ep);
    }

    #[test]
    fn test_endpoint_display_brackets_ipv6() {
        let v4 = Endpoint::new("10.0.0.1".parse().unwrap(), 53);
        let v6 = Endpoint::new("::1".parse().unwrap(), 443);
        assert_eq!(v4.to_string(), "10.0.0.1:53");
        assert_eq!(v6.to_string(), "[::1]:443");
    }

    #[test]
    fn test_destination_sentinel() {
        let event = NetworkEvent {
            path: "/usr/sbin/named".to_string(),
            action: Action::Bind,
            protocol: Protocol::Udp,
            family: AddressFamily::Inet,
            src: Endpoint::new("0.0.0.0".parse().unwrap(), 53),
            dst: Endpoint::unspecified(AddressFamily::Inet),
        };
        assert!(event.destination().is_none());
    }

    #[test]
    fn test_raw_conversions() {
        assert_eq!(Protocol::from_raw(IPPROTO_TCP), Some(Protocol::Tcp));
        assert_eq!(Protocol::from_raw(1), None);
        assert_eq!(AddressFamily::from_raw(AF_INET6), Some(AddressFamily::Inet6));
        assert_eq!(AddressFamily::from_raw(1), None);
        assert_eq!(Action::from_raw(Action::Close as u8), Some(Action::Close));
        assert_eq!(Action::from_raw(9), None);
    }
}
