//! Protocol module
//!
//! Authenticated frame codec, the ECDHE handshake that keys it, and the
//! KadRPC datagram envelope.

pub mod frame;
pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use frame::{Frame, FrameCodec, FrameHeader, FrameReader, FrameWriter, RunningHash, Secrets};
pub use handshake::{Ecdhe, Hello, Pending};
pub use message::{KadPacket, MessageType, Query, MAX_PACKET_SIZE};
pub use wire::{read_frame, write_frame};
