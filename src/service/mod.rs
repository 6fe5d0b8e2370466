//! Service module
//!
//! Wires the DHT, the KadRPC server and client and their queues into a
//! runnable node, and supervises long-running tasks under one root
//! cancellation token.

pub mod p2p;
pub mod supervisor;

pub use p2p::{NodeStats, P2pConfig, P2pNode};
pub use supervisor::{shutdown_signal, Supervisor, DRAIN_PERIOD};
