//! KadRPC messages
//!
//! Every UDP datagram is one envelope:
//!
//! ```text
//! type u8 | length u16 BE | payload (length bytes)
//! ```

use bytes::{BufMut, BytesMut};
use tracing::{error, trace};

use crate::error::P2pError;

/// Envelope header size
pub const ENVELOPE_HEADER_SIZE: usize = 3;
/// Largest datagram we send or accept (25 enodes of 176 bytes)
pub const MAX_PACKET_SIZE: usize = 4400;

/// Wire message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 0x02,
    FindNode = 0x03,
    FindValue = 0x04,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = P2pError;

    fn try_from(value: u8) -> Result<Self, P2pError> {
        trace!("Converting byte to MessageType: {:#04x}", value);
        match value {
            0x02 => Ok(MessageType::Ping),
            0x03 => Ok(MessageType::FindNode),
            0x04 => Ok(MessageType::FindValue),
            0xFF => Ok(MessageType::Error),
            _ => {
                error!("Invalid message type: {:#04x}", value);
                Err(P2pError::protocol_error_with_source(
                    "Invalid message type",
                    format!("value: {:#04x}", value),
                ))
            }
        }
    }
}

/// Requests the DHT answers; `ERROR` only ever travels as a reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    Ping,
    FindNode,
    FindValue,
}

impl TryFrom<MessageType> for Query {
    type Error = P2pError;

    fn try_from(value: MessageType) -> Result<Self, P2pError> {
        match value {
            MessageType::Ping => Ok(Query::Ping),
            MessageType::FindNode => Ok(Query::FindNode),
            MessageType::FindValue => Ok(Query::FindValue),
            MessageType::Error => Err(P2pError::protocol_error("ERROR is not a query")),
        }
    }
}

impl From<Query> for MessageType {
    fn from(query: Query) -> Self {
        match query {
            Query::Ping => MessageType::Ping,
            Query::FindNode => MessageType::FindNode,
            Query::FindValue => MessageType::FindValue,
        }
    }
}

/// One KadRPC envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KadPacket {
    pub kind: MessageType,
    pub payload: Vec<u8>,
}

impl KadPacket {
    pub fn new(kind: MessageType, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// `ERROR` envelope carrying a readable diagnostic
    pub fn error(reason: impl Into<String>) -> Self {
        Self::new(MessageType::Error, reason.into().into_bytes())
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    /// Serialize; payloads that would overflow a datagram are rejected
    pub fn encode(&self) -> Result<Vec<u8>, P2pError> {
        if ENVELOPE_HEADER_SIZE + self.payload.len() > MAX_PACKET_SIZE {
            return Err(P2pError::protocol_error_with_source(
                "Payload too large",
                format!("{} bytes", self.payload.len()),
            ));
        }
        let mut buf = BytesMut::with_capacity(ENVELOPE_HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.to_vec())
    }

    pub fn decode(data: &[u8]) -> Result<Self, P2pError> {
        trace!("Decoding KadRPC packet from {} bytes", data.len());
        if data.len() < ENVELOPE_HEADER_SIZE {
            return Err(P2pError::protocol_error_with_source(
                "Packet too short",
                format!("{} < {}", data.len(), ENVELOPE_HEADER_SIZE),
            ));
        }
        if data.len() > MAX_PACKET_SIZE {
            return Err(P2pError::protocol_error_with_source(
                "Packet too large",
                format!("{} > {}", data.len(), MAX_PACKET_SIZE),
            ));
        }

        let kind = MessageType::try_from(data[0])?;
        let length = u16::from_be_bytes([data[1], data[2]]) as usize;
        let payload = &data[ENVELOPE_HEADER_SIZE..];
        if payload.len() < length {
            return Err(P2pError::protocol_error_with_source(
                "Truncated payload",
                format!("{} < {}", payload.len(), length),
            ));
        }

        Ok(Self::new(kind, payload[..length].to_vec()))
    }

    /// Payload as text; used for `ERROR` diagnostics and enode lists
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let packet = KadPacket::new(MessageType::FindNode, b"abc".to_vec());
        assert_eq!(packet.encode().unwrap(), vec![0x03, 0x00, 0x03, b'a', b'b', b'c']);
    }

    #[test]
    fn test_decode() {
        let packet = KadPacket::decode(&[0x02, 0x00, 0x00]).unwrap();
        assert_eq!(packet, KadPacket::new(MessageType::Ping, vec![]));

        // trailing bytes past the declared length are ignored
        let packet = KadPacket::decode(&[0x04, 0x00, 0x01, 0x41, 0x42]).unwrap();
        assert_eq!(packet.payload, b"A");
    }

    #[test]
    fn test_decode_errors() {
        assert!(KadPacket::decode(&[0x02, 0x00]).is_err());
        assert!(KadPacket::decode(&[0x02, 0x00, 0x05, 0x01]).is_err());
        let err = KadPacket::decode(&[0x99, 0x00, 0x00]).unwrap_err();
        assert!(err.to_string().contains("0x99"));
        assert!(KadPacket::decode(&vec![0x02; MAX_PACKET_SIZE + 1]).is_err());
    }

    #[test]
    fn test_message_type_from_u8() {
        assert_eq!(MessageType::try_from(0x02).unwrap(), MessageType::Ping);
        assert_eq!(MessageType::try_from(0xFF).unwrap(), MessageType::Error);
        assert!(MessageType::try_from(0x01).is_err());
    }

    #[test]
    fn test_query_mapping() {
        assert_eq!(Query::try_from(MessageType::FindValue).unwrap(), Query::FindValue);
        assert!(Query::try_from(MessageType::Error).is_err());
        assert_eq!(MessageType::from(Query::Ping), MessageType::Ping);
    }

    #[test]
    fn test_error_packet() {
        let packet = KadPacket::error("bad type");
        assert!(packet.is_error());
        assert_eq!(packet.text(), "bad type");
        assert!(KadPacket::new(MessageType::Ping, vec![0; MAX_PACKET_SIZE]).encode().is_err());
    }
}
