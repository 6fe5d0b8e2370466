//! Enode URLs
//!
//! A node is addressed as
//!
//! ```text
//! enode://<hex uncompressed P-256 public key>@<ip>:<tcp-port>[?discport=<udp-port>]
//! ```
//!
//! and identified by the SHA-256 of its canonical URL. The canonical form
//! drops `discport` when the UDP and TCP ports are equal.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::crypto::ecies::{CurveKind, PrivateKey, PublicKey};
use crate::error::{IdentityErrorKind, P2pError};
use crate::identity::node_id::{NodeId, Protocol};

pub const SCHEME: &str = "enode";

/// 32-byte identifier: `sha256(canonical url)`
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnodeId(pub [u8; 32]);

impl EnodeId {
    pub fn from_url(url: &str) -> Self {
        EnodeId(Sha256::digest(url.as_bytes()).into())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let array: [u8; 32] = bytes.try_into().ok()?;
        Some(EnodeId(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for EnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for EnodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnodeId({})", &self.to_hex()[..16])
    }
}

/// Peer identity: public key plus endpoints
#[derive(Clone)]
pub struct Enode {
    public_key: PublicKey,
    /// Present only for the local node
    private_key: Option<PrivateKey>,
    ip: IpAddr,
    tcp_port: u16,
    udp_port: u16,
    url: String,
    id: EnodeId,
}

fn parse_ip(host: &str) -> Result<IpAddr, P2pError> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map_err(|_| P2pError::identity_error(IdentityErrorKind::InvalidIp, host))
}

fn require_p256(public_key: &PublicKey) -> Result<(), P2pError> {
    if public_key.curve() != CurveKind::P256 {
        return Err(P2pError::identity_error(
            IdentityErrorKind::InvalidPubKey,
            format!("{:?} key", public_key.curve()),
        ));
    }
    Ok(())
}

impl Enode {
    fn build(public_key: PublicKey, private_key: Option<PrivateKey>, ip: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        let key_hex = hex::encode(public_key.to_bytes());
        let endpoint = SocketAddr::new(ip, tcp_port);
        let url = if tcp_port == udp_port {
            format!("{}://{}@{}", SCHEME, key_hex, endpoint)
        } else {
            format!("{}://{}@{}?discport={}", SCHEME, key_hex, endpoint, udp_port)
        };
        let id = EnodeId::from_url(&url);
        Self {
            public_key,
            private_key,
            ip,
            tcp_port,
            udp_port,
            url,
            id,
        }
    }

    /// Parse an `enode://` URL
    pub fn parse(raw: &str) -> Result<Self, P2pError> {
        let url = Url::parse(raw).map_err(|e| {
            debug!("Failed to parse enode url {}: {}", raw, e);
            let kind = match e {
                url::ParseError::InvalidPort => IdentityErrorKind::InvalidPort,
                url::ParseError::EmptyHost
                | url::ParseError::InvalidIpv4Address
                | url::ParseError::InvalidIpv6Address
                | url::ParseError::InvalidDomainCharacter => IdentityErrorKind::InvalidIp,
                _ => IdentityErrorKind::InvalidScheme,
            };
            P2pError::identity_error(kind, raw)
        })?;

        if url.scheme() != SCHEME {
            return Err(P2pError::identity_error(IdentityErrorKind::InvalidScheme, raw));
        }

        let key_bytes = hex::decode(url.username())
            .map_err(|_| P2pError::identity_error(IdentityErrorKind::InvalidPubKey, raw))?;
        if key_bytes.is_empty() {
            return Err(P2pError::identity_error(IdentityErrorKind::InvalidPubKey, raw));
        }
        let public_key = PublicKey::from_bytes(CurveKind::P256, &key_bytes)
            .map_err(|_| P2pError::identity_error(IdentityErrorKind::InvalidPubKey, raw))?;

        let host = url
            .host_str()
            .ok_or_else(|| P2pError::identity_error(IdentityErrorKind::InvalidIp, raw))?;
        let ip = parse_ip(host).map_err(|_| P2pError::identity_error(IdentityErrorKind::InvalidIp, raw))?;

        let tcp_port = url
            .port()
            .ok_or_else(|| P2pError::identity_error(IdentityErrorKind::InvalidPort, raw))?;

        let mut udp_port = tcp_port;
        if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == "discport") {
            if !value.is_empty() {
                udp_port = value
                    .parse::<u16>()
                    .map_err(|_| P2pError::identity_error(IdentityErrorKind::InvalidPort, raw))?;
            }
        }

        Ok(Self::build(public_key, None, ip, tcp_port, udp_port))
    }

    /// Local node from its private key
    pub fn from_private_key(key: PrivateKey, host: &str, tcp_port: u16, udp_port: u16) -> Result<Self, P2pError> {
        let public_key = key.public_key();
        require_p256(&public_key)?;
        let ip = parse_ip(host)?;
        Ok(Self::build(public_key, Some(key), ip, tcp_port, udp_port))
    }

    /// Local node from a PEM encoded P-256 private key
    pub fn from_pem(pem: &str, host: &str, tcp_port: u16, udp_port: u16) -> Result<Self, P2pError> {
        let key = PrivateKey::from_pem(pem)?;
        Self::from_private_key(key, host, tcp_port, udp_port)
    }

    /// Key-only node with unspecified endpoints
    pub fn from_public_key(public_key: PublicKey) -> Result<Self, P2pError> {
        require_p256(&public_key)?;
        Ok(Self::build(public_key, None, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 0))
    }

    pub fn id(&self) -> EnodeId {
        self.id
    }

    /// Canonical URL
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    pub fn private_key(&self) -> Option<&PrivateKey> {
        self.private_key.as_ref()
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn tcp_port(&self) -> u16 {
        self.tcp_port
    }

    pub fn udp_port(&self) -> u16 {
        self.udp_port
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }

    /// Packed id of one of this node's endpoints
    pub fn node_id(&self, zone: u16, protocol: Protocol) -> Result<NodeId, P2pError> {
        let addr = match protocol {
            Protocol::Tcp => self.tcp_addr(),
            Protocol::Udp => self.udp_addr(),
        };
        NodeId::from_socket_addr(zone, protocol, addr)
    }
}

impl PartialEq for Enode {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Enode {}

impl fmt::Display for Enode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url)
    }
}

impl fmt::Debug for Enode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enode")
            .field("id", &self.id)
            .field("tcp", &self.tcp_addr())
            .field("udp", &self.udp_port)
            .finish()
    }
}

impl FromStr for Enode {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Enode::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(host: &str, tcp: u16, udp: u16) -> Enode {
        Enode::from_private_key(PrivateKey::generate(CurveKind::P256), host, tcp, udp).unwrap()
    }

    #[test]
    fn test_roundtrip_same_ports() {
        let node = local("192.168.1.101", 13147, 13147);
        assert!(!node.url().contains("discport"));
        let parsed = Enode::parse(node.url()).unwrap();
        assert_eq!(parsed.url(), node.url());
        assert_eq!(parsed.id(), node.id());
        assert_eq!(parsed.public_key(), node.public_key());
        assert!(parsed.private_key().is_none());
    }

    #[test]
    fn test_roundtrip_discport() {
        let node = local("127.0.0.1", 4321, 4322);
        assert!(node.url().ends_with("@127.0.0.1:4321?discport=4322"));
        let parsed: Enode = node.url().parse().unwrap();
        assert_eq!(parsed.tcp_port(), 4321);
        assert_eq!(parsed.udp_port(), 4322);
        assert_eq!(parsed.udp_addr(), "127.0.0.1:4322".parse::<SocketAddr>().unwrap());
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_id_is_sha256_of_url() {
        let node = local("10.3.58.6", 30303, 30301);
        let digest: [u8; 32] = Sha256::digest(node.url().as_bytes()).into();
        assert_eq!(node.id().0, digest);
        assert_eq!(EnodeId::from_hex(&node.id().to_hex()), Some(node.id()));
    }

    #[test]
    fn test_ipv6_host() {
        let node = local("::1", 30303, 30303);
        assert!(node.url().ends_with("@[::1]:30303"));
        let parsed = Enode::parse(node.url()).unwrap();
        assert_eq!(parsed.ip(), "::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_parse_errors() {
        let node = local("127.0.0.1", 30303, 30303);
        let key_hex = hex::encode(node.public_key().to_bytes());

        let cases = [
            (format!("http://{}@127.0.0.1:30303", key_hex), IdentityErrorKind::InvalidScheme),
            ("enode://zz@127.0.0.1:30303".to_string(), IdentityErrorKind::InvalidPubKey),
            ("enode://0400@127.0.0.1:30303".to_string(), IdentityErrorKind::InvalidPubKey),
            (format!("enode://{}@host.example:30303", key_hex), IdentityErrorKind::InvalidIp),
            (format!("enode://{}@127.0.0.1", key_hex), IdentityErrorKind::InvalidPort),
            (format!("enode://{}@127.0.0.1:70000", key_hex), IdentityErrorKind::InvalidPort),
            (format!("enode://{}@127.0.0.1:30303?discport=x", key_hex), IdentityErrorKind::InvalidPort),
        ];
        for (raw, kind) in cases {
            let err = Enode::parse(&raw).unwrap_err();
            assert_eq!(err.identity_kind(), Some(kind), "{}", raw);
        }
    }

    #[test]
    fn test_pem_constructor() {
        let key = PrivateKey::generate(CurveKind::P256);
        let pem = key.to_pem().unwrap();
        let node = Enode::from_pem(&pem, "127.0.0.1", 1, 2).unwrap();
        assert_eq!(node.public_key(), &key.public_key());
        assert!(node.private_key().is_some());
    }

    #[test]
    fn test_rejects_non_p256_and_bad_host() {
        let p384 = PrivateKey::generate(CurveKind::P384);
        assert!(Enode::from_private_key(p384, "127.0.0.1", 1, 1).is_err());
        let err = Enode::from_private_key(PrivateKey::generate(CurveKind::P256), "nope", 1, 1).unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::InvalidIp));
    }

    #[test]
    fn test_node_id_projection() {
        let node = local("10.0.0.7", 4000, 4001);
        let udp = node.node_id(3, Protocol::Udp).unwrap();
        assert_eq!(udp.port(), 4001);
        assert_eq!(udp.protocol(), Some(Protocol::Udp));
        assert_eq!(udp.ipv4(), Ipv4Addr::new(10, 0, 0, 7));
    }
}
