//! Queue module
//!
//! Bounded, timeout-aware event queues that connect the UDP RPC layer and
//! the DHT.

pub mod queue;

pub use queue::{EventQueue, QueueConfig, QueueStats, DEFAULT_CAPACITY, DEFAULT_PUSH_TIMEOUT};
