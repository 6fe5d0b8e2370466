//! Identity module
//!
//! Enode URLs with their 32-byte ids, packed 64-bit endpoint ids and the
//! injected id generators.

pub mod enode;
pub mod idgen;
pub mod node_id;

pub use enode::{Enode, EnodeId};
pub use idgen::{IdGenerator, SequenceIdGenerator, SnowflakeIdGenerator};
pub use node_id::{NodeId, Protocol};
