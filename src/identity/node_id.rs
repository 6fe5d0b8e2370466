//! Packed 64-bit node identifiers
//!
//! Layout, MSB first:
//!
//! ```text
//! | zone (12) | protocol (4) | port (16) | ipv4 (32) |
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use serde::{Deserialize, Serialize};

use crate::error::{IdentityErrorKind, P2pError};

/// Mask selecting the zone bits of the 16-bit zone field
pub const ZONE_MASK: u16 = 0xFFF0;
/// Mask selecting the protocol nibble of the 16-bit zone field
pub const PROTOCOL_MASK: u16 = 0x000F;

/// Transport protocol carried in the low nibble of the zone field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp = 1,
    Udp = 2,
}

impl TryFrom<u8> for Protocol {
    type Error = P2pError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Protocol::Tcp),
            2 => Ok(Protocol::Udp),
            other => Err(P2pError::validation_error_with_field(
                format!("unknown protocol nibble {:#x}", other),
                "protocol",
            )),
        }
    }
}

/// Packed `{zone, protocol, port, ipv4}` identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Pack from a 12-bit zone number, protocol, port and address
    pub fn new(zone: u16, protocol: Protocol, port: u16, ipv4: Ipv4Addr) -> Self {
        let field = (zone << 4) & ZONE_MASK | protocol as u16;
        Self::pack(field, port, u32::from(ipv4))
    }

    /// Pack raw fields; `zone_field` already carries the protocol nibble
    pub fn pack(zone_field: u16, port: u16, ipv4: u32) -> Self {
        NodeId((zone_field as u64) << 48 | (port as u64) << 32 | ipv4 as u64)
    }

    /// Inverse of [`NodeId::pack`]
    pub fn unpack(self) -> (u16, u16, u32) {
        (self.zone_field(), self.port(), self.ipv4_raw())
    }

    /// Build from `"ip:port"`; only IPv4 endpoints can be packed
    pub fn from_addr(zone: u16, protocol: Protocol, addr: &str) -> Result<Self, P2pError> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|_| P2pError::identity_error(IdentityErrorKind::InvalidIp, addr))?;
        Self::from_socket_addr(zone, protocol, addr)
    }

    pub fn from_socket_addr(zone: u16, protocol: Protocol, addr: SocketAddr) -> Result<Self, P2pError> {
        match addr.ip() {
            IpAddr::V4(ip) => Ok(Self::new(zone, protocol, addr.port(), ip)),
            IpAddr::V6(ip) => match ip.to_ipv4_mapped() {
                Some(ip) => Ok(Self::new(zone, protocol, addr.port(), ip)),
                None => Err(P2pError::identity_error(IdentityErrorKind::InvalidIp, addr.to_string())),
            },
        }
    }

    /// Raw 16-bit zone field including the protocol nibble
    pub fn zone_field(&self) -> u16 {
        (self.0 >> 48) as u16
    }

    /// 12-bit zone number
    pub fn zone(&self) -> u16 {
        (self.zone_field() & ZONE_MASK) >> 4
    }

    pub fn protocol_nibble(&self) -> u8 {
        (self.zone_field() & PROTOCOL_MASK) as u8
    }

    pub fn protocol(&self) -> Option<Protocol> {
        Protocol::try_from(self.protocol_nibble()).ok()
    }

    pub fn port(&self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub fn ipv4_raw(&self) -> u32 {
        self.0 as u32
    }

    pub fn ipv4(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.ipv4_raw())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ipv4(), self.port()))
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        NodeId(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let id = NodeId::new(0x123, Protocol::Udp, 30303, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(id.0, 0x1232_765f_0a00_0001);
        assert_eq!(id.zone(), 0x123);
        assert_eq!(id.protocol(), Some(Protocol::Udp));
        assert_eq!(id.port(), 30303);
        assert_eq!(id.ipv4(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(id.to_hex(), "1232765f0a000001");
    }

    #[test]
    fn test_unpack_is_total() {
        for raw in [0u64, u64::MAX, 0x8000_0000_0000_0000, 0x0001_0002_0003_0004, 0xfff3_ffff_0000_0000] {
            let (zone, port, ipv4) = NodeId(raw).unpack();
            assert_eq!(NodeId::pack(zone, port, ipv4).0, raw);
        }
    }

    #[test]
    fn test_protocol_nibble_preserved() {
        let tcp = NodeId::new(0xfff, Protocol::Tcp, 1, Ipv4Addr::LOCALHOST);
        assert_eq!(tcp.protocol_nibble(), 1);
        assert_eq!(tcp.zone_field() & ZONE_MASK, 0xfff0);
        assert_eq!(NodeId(0x0003_0000_0000_0000).protocol(), None);
    }

    #[test]
    fn test_from_addr() {
        let id = NodeId::from_addr(1, Protocol::Tcp, "192.168.1.2:8080").unwrap();
        assert_eq!(id.socket_addr(), "192.168.1.2:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(id.zone(), 1);

        let err = NodeId::from_addr(1, Protocol::Tcp, "not-an-addr").unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::InvalidIp));
        assert!(NodeId::from_addr(1, Protocol::Tcp, "[::1]:80").is_err());
    }
}
