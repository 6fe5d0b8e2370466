//! DHT node module
//!
//! A routing table entry: a peer's enode plus liveness bookkeeping.

use std::time::{Duration, Instant};

use crate::identity::{Enode, EnodeId};

/// Represents a DHT node
#[derive(Debug, Clone)]
pub struct Node {
    /// 32-byte identifier, `sha256(url)` for every node built from an enode
    pub id: EnodeId,
    pub enode: Enode,
    /// When the node was last heard from
    pub last_seen: Instant,
    /// Answered PINGs
    pub ping_ok: u64,
    /// PINGs sent
    pub ping_total: u64,
}

impl Node {
    pub fn new(enode: Enode) -> Self {
        Self {
            id: enode.id(),
            enode,
            last_seen: Instant::now(),
            ping_ok: 0,
            ping_total: 0,
        }
    }

    /// Entry whose id is supplied rather than derived from the enode
    pub fn with_id(id: EnodeId, enode: Enode) -> Self {
        Self { id, ..Self::new(enode) }
    }

    /// Seen within `liveness`
    pub fn is_live(&self, liveness: Duration) -> bool {
        self.last_seen.elapsed() <= liveness
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Account for one PING; a reply also counts as contact
    pub fn record_ping(&mut self, answered: bool) {
        self.ping_total += 1;
        if answered {
            self.ping_ok += 1;
            self.touch();
        }
    }

    pub fn time_since_seen(&self) -> Duration {
        self.last_seen.elapsed()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}
