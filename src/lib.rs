//! kad-p2p
//!
//! Kademlia peer discovery over UDP, plus an authenticated, encrypted and
//! multiplexed TCP transport bootstrapped by an ECIES handshake.

pub mod cli;
pub mod crypto;
pub mod dht;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod queue;
pub mod radix;
pub mod rpc;
pub mod service;
pub mod transport;

pub use error::P2pError;

pub use cli::{CliArgs, Config, LogFormat};
pub use crypto::{CurveKind, PrivateKey, PublicKey};
pub use dht::{Dht, DhtConfig, FileStore, KvStore, MemoryStore, Node, RoutingTable};
pub use identity::{Enode, EnodeId, IdGenerator, NodeId, Protocol, SequenceIdGenerator};
pub use protocol::{Ecdhe, FrameCodec, KadPacket, MessageType, Query};
pub use queue::{EventQueue, QueueConfig};
pub use radix::RadixTrie;
pub use rpc::{KadClient, KadRequest, KadServer};
pub use service::{NodeStats, P2pConfig, P2pNode, Supervisor};
pub use transport::{EchoHandler, FrameHandler, Session, TcpClient, TcpServer, TransportConfig};
