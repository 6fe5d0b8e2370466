//! Error types for the p2p node
//!
//! This module defines the error taxonomy shared by the crypto primitives,
//! the framed transport, the DHT and the Kad RPC layer.

use std::fmt;

/// Failure kinds raised by the cryptographic primitives and the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoErrorKind {
    InvalidKeySize,
    InvalidIvSize,
    InvalidCurve,
    InvalidPublicKey,
    InvalidMessage,
    SharedKeyIsPointAtInfinity,
    UnsupportedAlgorithm,
    InvalidSignature,
    DecryptFailed,
}

impl fmt::Display for CryptoErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CryptoErrorKind::InvalidKeySize => "invalid key size",
            CryptoErrorKind::InvalidIvSize => "invalid iv size",
            CryptoErrorKind::InvalidCurve => "invalid elliptic curve",
            CryptoErrorKind::InvalidPublicKey => "invalid public key",
            CryptoErrorKind::InvalidMessage => "invalid message",
            CryptoErrorKind::SharedKeyIsPointAtInfinity => "shared key is point at infinity",
            CryptoErrorKind::UnsupportedAlgorithm => "unsupported algorithm",
            CryptoErrorKind::InvalidSignature => "invalid signature",
            CryptoErrorKind::DecryptFailed => "decrypt failed",
        };
        f.write_str(name)
    }
}

/// Failure kinds raised while parsing node identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityErrorKind {
    InvalidScheme,
    InvalidPubKey,
    InvalidIp,
    InvalidPort,
}

impl fmt::Display for IdentityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentityErrorKind::InvalidScheme => "invalid scheme",
            IdentityErrorKind::InvalidPubKey => "invalid public key",
            IdentityErrorKind::InvalidIp => "invalid ip",
            IdentityErrorKind::InvalidPort => "invalid port",
        };
        f.write_str(name)
    }
}

/// Failure kinds raised by the frame codec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameErrorKind {
    BadHeaderSign,
    BadBodySign,
    ShortRead,
    TooLarge,
}

impl fmt::Display for FrameErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FrameErrorKind::BadHeaderSign => "bad header sign",
            FrameErrorKind::BadBodySign => "bad body sign",
            FrameErrorKind::ShortRead => "short read",
            FrameErrorKind::TooLarge => "frame too large",
        };
        f.write_str(name)
    }
}

/// Comprehensive error type for p2p operations
#[derive(Debug, Clone)]
pub enum P2pError {
    /// Hash, cipher, ECIES and handshake errors
    CryptoError {
        kind: CryptoErrorKind,
        message: String,
    },

    /// Enode and node id errors
    IdentityError {
        kind: IdentityErrorKind,
        input: Option<String>,
    },

    /// Frame codec errors, fatal to the owning session
    FrameError {
        kind: FrameErrorKind,
        source: Option<String>,
    },

    /// Kad wire protocol errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// DHT (Distributed Hash Table) errors
    DHTError {
        message: String,
        node: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },

    /// Validation errors
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// Lookup misses
    NotFound {
        message: String,
        key: Option<String>,
    },

    /// Deadline exceeded
    Timeout {
        message: String,
        operation: Option<String>,
    },

    /// Listen/bind and task supervision failures
    LifecycleError {
        message: String,
        source: Option<String>,
    },
}

impl P2pError {
    /// Create a new CryptoError
    pub fn crypto_error(kind: CryptoErrorKind, message: impl Into<String>) -> Self {
        P2pError::CryptoError {
            kind,
            message: message.into(),
        }
    }

    /// Create a new IdentityError
    pub fn identity_error(kind: IdentityErrorKind, input: impl Into<String>) -> Self {
        P2pError::IdentityError {
            kind,
            input: Some(input.into()),
        }
    }

    /// Create a new FrameError
    pub fn frame_error(kind: FrameErrorKind) -> Self {
        P2pError::FrameError { kind, source: None }
    }

    /// Create a new FrameError with source
    pub fn frame_error_with_source(kind: FrameErrorKind, source: impl Into<String>) -> Self {
        P2pError::FrameError {
            kind,
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        P2pError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        P2pError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new DHTError with node
    pub fn dht_error_with_node(message: impl Into<String>, node: impl Into<String>) -> Self {
        P2pError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: None,
        }
    }

    /// Create a new DHTError with node and source
    pub fn dht_error_full(message: impl Into<String>, node: impl Into<String>, source: impl Into<String>) -> Self {
        P2pError::DHTError {
            message: message.into(),
            node: Some(node.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        P2pError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        P2pError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new ValidationError with field
    pub fn validation_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        P2pError::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new NotFound with the missing key
    pub fn not_found_with_key(message: impl Into<String>, key: impl Into<String>) -> Self {
        P2pError::NotFound {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Create a new Timeout naming the operation that expired
    pub fn timeout(message: impl Into<String>, operation: impl Into<String>) -> Self {
        P2pError::Timeout {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }

    /// Create a new LifecycleError with source
    pub fn lifecycle_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        P2pError::LifecycleError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Crypto failure kind, if this is a crypto error
    pub fn crypto_kind(&self) -> Option<CryptoErrorKind> {
        match self {
            P2pError::CryptoError { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Identity failure kind, if this is an identity error
    pub fn identity_kind(&self) -> Option<IdentityErrorKind> {
        match self {
            P2pError::IdentityError { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Frame failure kind, if this is a frame error
    pub fn frame_kind(&self) -> Option<FrameErrorKind> {
        match self {
            P2pError::FrameError { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Add context to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        let ctx = context.into();
        match &mut self {
            P2pError::FrameError { source, .. }
            | P2pError::ProtocolError { source, .. }
            | P2pError::DHTError { source, .. }
            | P2pError::NetworkError { source, .. }
            | P2pError::LifecycleError { source, .. } => {
                *source = Some(source.as_ref().map_or_else(|| ctx.clone(), |s| format!("{}: {}", s, ctx)));
            }
            P2pError::CryptoError { message, .. } => {
                *message = format!("{}: {}", message, ctx);
            }
            _ => {}
        }
        self
    }
}

impl fmt::Display for P2pError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            P2pError::CryptoError { kind, message } => {
                if message.is_empty() {
                    write!(f, "Crypto error: {}", kind)
                } else {
                    write!(f, "Crypto error: {} ({})", kind, message)
                }
            }
            P2pError::IdentityError { kind, input } => {
                if let Some(input) = input {
                    write!(f, "Identity error: {} (input: {})", kind, input)
                } else {
                    write!(f, "Identity error: {}", kind)
                }
            }
            P2pError::FrameError { kind, source } => {
                if let Some(src) = source {
                    write!(f, "Frame error: {} (source: {})", kind, src)
                } else {
                    write!(f, "Frame error: {}", kind)
                }
            }
            P2pError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            P2pError::DHTError { message, node, source } => match (node, source) {
                (Some(n), Some(s)) => write!(f, "DHT error: {} (node: {}, source: {})", message, n, s),
                (Some(n), None) => write!(f, "DHT error: {} (node: {})", message, n),
                (None, Some(s)) => write!(f, "DHT error: {} (source: {})", message, s),
                (None, None) => write!(f, "DHT error: {}", message),
            },
            P2pError::NetworkError { message, address, source } => match (address, source) {
                (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                (None, None) => write!(f, "Network error: {}", message),
            },
            P2pError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
            P2pError::ValidationError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Validation error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Validation error: {}", message)
                }
            }
            P2pError::NotFound { message, key } => {
                if let Some(k) = key {
                    write!(f, "Not found: {} (key: {})", message, k)
                } else {
                    write!(f, "Not found: {}", message)
                }
            }
            P2pError::Timeout { message, operation } => {
                if let Some(op) = operation {
                    write!(f, "Timeout: {} (operation: {})", message, op)
                } else {
                    write!(f, "Timeout: {}", message)
                }
            }
            P2pError::LifecycleError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Lifecycle error: {} (source: {})", message, src)
                } else {
                    write!(f, "Lifecycle error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for P2pError {}

impl From<std::io::Error> for P2pError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            return P2pError::frame_error_with_source(FrameErrorKind::ShortRead, err.to_string());
        }
        P2pError::network_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::ConfigError {
            message: format!("Failed to parse JSON data: {}", err),
            field: None,
        }
    }
}

impl From<std::net::AddrParseError> for P2pError {
    fn from(err: std::net::AddrParseError) -> Self {
        P2pError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for P2pError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        P2pError::Timeout {
            message: "Operation timed out".to_string(),
            operation: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crypto_error_display() {
        let err = P2pError::crypto_error(CryptoErrorKind::InvalidKeySize, "sm4 key must be 16 bytes");
        assert_eq!(err.to_string(), "Crypto error: invalid key size (sm4 key must be 16 bytes)");
        assert_eq!(err.crypto_kind(), Some(CryptoErrorKind::InvalidKeySize));
    }

    #[test]
    fn test_identity_error_kind() {
        let err = P2pError::identity_error(IdentityErrorKind::InvalidScheme, "http://x");
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::InvalidScheme));
        assert!(err.to_string().contains("http://x"));
        assert_eq!(err.frame_kind(), None);
    }

    #[test]
    fn test_dht_error_full() {
        let err = P2pError::dht_error_full("refresh failed", "abcd", "timeout");
        let s = err.to_string();
        assert!(s.contains("DHT error"));
        assert!(s.contains("abcd"));
        assert!(s.contains("timeout"));
    }

    #[test]
    fn test_dht_error_with_node() {
        let err = P2pError::dht_error_with_node("reply dropped", "127.0.0.1:30303");
        assert_eq!(err.to_string(), "DHT error: reply dropped (node: 127.0.0.1:30303)");
    }

    #[test]
    fn test_not_found_with_key() {
        let err = P2pError::not_found_with_key("no matching prefix", "42");
        assert_eq!(err.to_string(), "Not found: no matching prefix (key: 42)");
    }

    #[test]
    fn test_with_context() {
        let err = P2pError::protocol_error("bad envelope").with_context("while parsing udp packet");
        assert!(err.to_string().contains("while parsing udp packet"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: P2pError = io_err.into();
        assert!(matches!(err, P2pError::NetworkError { .. }));
    }

    #[test]
    fn test_from_eof_is_short_read() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        let err: P2pError = io_err.into();
        assert_eq!(err.frame_kind(), Some(FrameErrorKind::ShortRead));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: P2pError = addr_err.into();
        assert!(matches!(err, P2pError::NetworkError { .. }));
    }

    #[test]
    fn test_timeout_display() {
        let err = P2pError::timeout("no reply", "request_reply");
        assert!(err.to_string().contains("Timeout"));
        assert!(err.to_string().contains("request_reply"));
    }

    #[test]
    fn test_validation_error_with_field() {
        let err = P2pError::validation_error_with_field("Value out of range", "port");
        assert!(err.to_string().contains("Validation error"));
        assert!(err.to_string().contains("port"));
    }
}
