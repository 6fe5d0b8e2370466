//! DHT (Distributed Hash Table) module
//!
//! Kademlia routing over 32-byte enode ids, fed by the KadRPC queues.

pub mod dht;
pub mod node;
pub mod routing;
pub mod store;

pub use dht::{Dht, DhtConfig, ENODE_PREFIX};
pub use node::Node;
pub use routing::{dist, xor, Bucket, BucketPolicy, Insertion, RoutingTable, K, N_BUCKET};
pub use store::{FileStore, KvStore, MemoryStore};
