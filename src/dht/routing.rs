//! DHT routing table module
//!
//! Kademlia routing table keyed by the bit index of the first difference
//! between the local id and a peer id.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::dht::node::Node;
use crate::error::P2pError;
use crate::identity::{Enode, EnodeId, Protocol};
use crate::radix::RadixTrie;

/// Bytes in a peer id
pub const ID_BYTES: usize = 32;
/// One bucket per possible distance
pub const N_BUCKET: usize = ID_BYTES * 8;
/// Kademlia constant - nodes per bucket and replies per lookup
pub const K: usize = 20;

/// Bit index of the first difference between `a` and `b`, counted from the
/// most significant bit. Equal inputs give `8 * len`.
pub fn dist(a: &[u8], b: &[u8]) -> Result<usize, P2pError> {
    if a.len() != b.len() {
        return Err(P2pError::validation_error_with_field(
            format!("id length mismatch: {} != {}", a.len(), b.len()),
            "id",
        ));
    }
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        let diff = x ^ y;
        if diff != 0 {
            return Ok(8 * i + diff.leading_zeros() as usize);
        }
    }
    Ok(8 * a.len())
}

/// Full XOR metric; compares lexicographically
pub fn xor(a: &EnodeId, b: &EnodeId) -> [u8; ID_BYTES] {
    let mut out = [0u8; ID_BYTES];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a.0[i] ^ b.0[i];
    }
    out
}

/// What to do when a peer maps to a full bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketPolicy {
    /// Keep the bucket as is
    #[default]
    DropNewcomer,
    /// Replace the entry seen least recently
    EvictOldest,
}

/// Outcome of a table insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insertion {
    Added,
    /// Already present; last-seen bumped
    Refreshed,
    /// Bucket full, or the peer is ourselves
    Rejected,
    /// Bucket full; the returned entry made room
    Replaced(Node),
}

/// A bucket in the routing table
#[derive(Debug, Clone, Default)]
pub struct Bucket {
    /// Insertion order
    nodes: Vec<Node>,
}

impl Bucket {
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &EnodeId) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == *id)
    }

    fn get_mut(&mut self, id: &EnodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == *id)
    }

    fn insert(&mut self, node: Node, k: usize, policy: BucketPolicy) -> Insertion {
        if let Some(existing) = self.get_mut(&node.id) {
            existing.enode = node.enode;
            existing.touch();
            return Insertion::Refreshed;
        }

        if self.nodes.len() < k {
            self.nodes.push(node);
            return Insertion::Added;
        }

        match policy {
            BucketPolicy::DropNewcomer => Insertion::Rejected,
            BucketPolicy::EvictOldest => {
                let oldest = self
                    .nodes
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, n)| n.last_seen)
                    .map(|(i, _)| i);
                match oldest {
                    Some(i) => {
                        let evicted = self.nodes.remove(i);
                        self.nodes.push(node);
                        Insertion::Replaced(evicted)
                    }
                    None => Insertion::Rejected,
                }
            }
        }
    }

    fn remove(&mut self, id: &EnodeId) -> Option<Node> {
        let pos = self.nodes.iter().position(|n| n.id == *id)?;
        Some(self.nodes.remove(pos))
    }

    fn evict_stale(&mut self, liveness: Duration) -> Vec<Node> {
        let (live, stale): (Vec<Node>, Vec<Node>) = self.nodes.drain(..).partition(|n| n.is_live(liveness));
        self.nodes = live;
        stale
    }
}

/// Kademlia routing table
#[derive(Debug)]
pub struct RoutingTable {
    local: Node,
    buckets: Vec<Bucket>,
    k: usize,
    policy: BucketPolicy,
    zone: u16,
    /// Packed UDP endpoint -> bucket index
    endpoints: RadixTrie<u64>,
}

impl RoutingTable {
    pub fn new(local: Enode, k: usize, policy: BucketPolicy, zone: u16) -> Self {
        Self::with_local(Node::new(local), k, policy, zone)
    }

    /// Table centred on an explicit local entry
    pub fn with_local(local: Node, k: usize, policy: BucketPolicy, zone: u16) -> Self {
        Self {
            local,
            buckets: vec![Bucket::default(); N_BUCKET],
            k,
            policy,
            zone,
            endpoints: RadixTrie::new(),
        }
    }

    pub fn local(&self) -> &Node {
        &self.local
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn policy(&self) -> BucketPolicy {
        self.policy
    }

    /// Bucket for `id`; `None` for our own id
    pub fn bucket_index(&self, id: &EnodeId) -> Option<usize> {
        let d = dist(&self.local.id.0, &id.0).ok()?;
        (d < N_BUCKET).then_some(d)
    }

    pub fn add(&mut self, enode: Enode) -> Insertion {
        self.insert(Node::new(enode))
    }

    pub fn insert(&mut self, node: Node) -> Insertion {
        let index = match self.bucket_index(&node.id) {
            Some(index) => index,
            None => return Insertion::Rejected,
        };
        let endpoint = node.enode.clone();
        let outcome = self.buckets[index].insert(node, self.k, self.policy);

        match &outcome {
            Insertion::Added => {
                trace!("bucket[{}] set node {}", index, endpoint.id());
                self.index_endpoint(&endpoint, index);
            }
            Insertion::Replaced(evicted) => {
                debug!("bucket[{}] evicted {} for {}", index, evicted.id, endpoint.id());
                self.unindex_endpoint(&evicted.enode);
                self.index_endpoint(&endpoint, index);
            }
            Insertion::Refreshed => self.index_endpoint(&endpoint, index),
            Insertion::Rejected => trace!("bucket[{}] full, dropping {}", index, endpoint.id()),
        }
        outcome
    }

    /// Bump last-seen; `false` if the peer is unknown
    pub fn touch(&mut self, id: &EnodeId) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.touch();
                true
            }
            None => false,
        }
    }

    pub fn record_ping(&mut self, id: &EnodeId, answered: bool) -> bool {
        match self.get_mut(id) {
            Some(node) => {
                node.record_ping(answered);
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &EnodeId) -> Option<Node> {
        let index = self.bucket_index(id)?;
        let removed = self.buckets[index].remove(id)?;
        self.unindex_endpoint(&removed.enode);
        Some(removed)
    }

    /// Drop every entry not seen within `liveness`
    pub fn evict_stale(&mut self, liveness: Duration) -> Vec<Node> {
        let mut evicted = Vec::new();
        for bucket in self.buckets.iter_mut() {
            evicted.extend(bucket.evict_stale(liveness));
        }
        for node in &evicted {
            self.unindex_endpoint(&node.enode);
        }
        evicted
    }

    pub fn get(&self, id: &EnodeId) -> Option<&Node> {
        let index = self.bucket_index(id)?;
        self.buckets[index].get(id)
    }

    fn get_mut(&mut self, id: &EnodeId) -> Option<&mut Node> {
        let index = self.bucket_index(id)?;
        self.buckets[index].get_mut(id)
    }

    pub fn bucket(&self, index: usize) -> Option<&Bucket> {
        self.buckets.get(index)
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Every entry, bucket by bucket
    pub fn nodes(&self) -> Vec<Node> {
        self.buckets.iter().flat_map(|b| b.nodes.iter().cloned()).collect()
    }

    pub fn node_count(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    /// Up to `count` entries closest to `target` by XOR, nearest first.
    ///
    /// The local node is a candidate like any peer. Equal distances keep
    /// walk order.
    pub fn k_closest(&self, target: &EnodeId, count: usize) -> Vec<Node> {
        let mut closest: Vec<([u8; ID_BYTES], &Node)> = Vec::with_capacity(count + 1);
        let candidates = std::iter::once(&self.local).chain(self.buckets.iter().flat_map(|b| b.nodes.iter()));

        for node in candidates {
            let d = xor(&node.id, target);
            let pos = closest.partition_point(|(x, _)| *x <= d);
            if pos >= count {
                continue;
            }
            closest.insert(pos, (d, node));
            closest.truncate(count);
        }

        closest.into_iter().map(|(_, node)| node.clone()).collect()
    }

    /// The single entry closest to `target`, ourselves included
    pub fn closest(&self, target: &EnodeId) -> Node {
        self.k_closest(target, 1)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.local.clone())
    }

    /// Bucket holding the peer reachable at `addr` over UDP
    pub fn bucket_of(&self, addr: SocketAddr) -> Option<usize> {
        let key = crate::identity::NodeId::from_socket_addr(self.zone, Protocol::Udp, addr).ok()?;
        self.endpoints.get(key.0).ok().map(|index| index as usize)
    }

    fn index_endpoint(&mut self, enode: &Enode, index: usize) {
        match enode.node_id(self.zone, Protocol::Udp) {
            Ok(key) => {
                if let Err(e) = self.endpoints.add(key.0, u64::MAX, index as u64) {
                    debug!("Failed to index endpoint {}: {}", enode.udp_addr(), e);
                }
            }
            Err(e) => trace!("Endpoint {} not indexable: {}", enode.udp_addr(), e),
        }
    }

    fn unindex_endpoint(&mut self, enode: &Enode) {
        let key = match enode.node_id(self.zone, Protocol::Udp) {
            Ok(key) => key,
            Err(_) => return,
        };
        self.endpoints.del(key.0, u64::MAX);

        // Another entry may share the endpoint
        let addr = enode.udp_addr();
        let survivor = self
            .buckets
            .iter()
            .enumerate()
            .find_map(|(i, b)| b.nodes.iter().any(|n| n.enode.udp_addr() == addr).then_some(i));
        if let Some(index) = survivor {
            if let Err(e) = self.endpoints.add(key.0, u64::MAX, index as u64) {
                debug!("Failed to re-index endpoint {}: {}", addr, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ecies::{CurveKind, PrivateKey};

    fn enode(port: u16) -> Enode {
        Enode::from_private_key(PrivateKey::generate(CurveKind::P256), "127.0.0.1", port, port).unwrap()
    }

    fn id_with_bit(bit: usize) -> EnodeId {
        let mut id = [0u8; ID_BYTES];
        id[bit / 8] |= 0x80 >> (bit % 8);
        EnodeId(id)
    }

    fn id_with_last_byte(b: u8) -> EnodeId {
        let mut id = [0u8; ID_BYTES];
        id[ID_BYTES - 1] = b;
        EnodeId(id)
    }

    fn zero_table(k: usize, policy: BucketPolicy) -> RoutingTable {
        RoutingTable::with_local(Node::with_id(EnodeId([0u8; ID_BYTES]), enode(30000)), k, policy, 0)
    }

    #[test]
    fn test_dist_properties() {
        let a = [0x5Au8; 32];
        let mut b = a;
        b[3] ^= 0x04;
        assert_eq!(dist(&a, &a).unwrap(), 256);
        assert_eq!(dist(&a, &b).unwrap(), 3 * 8 + 5);
        assert_eq!(dist(&a, &b).unwrap(), dist(&b, &a).unwrap());
        assert_eq!(dist(&[0x80], &[0x00]).unwrap(), 0);
    }

    #[test]
    fn test_dist_length_mismatch() {
        assert!(dist(&[0u8; 32], &[0u8; 16]).is_err());
    }

    #[test]
    fn test_bucket_seating() {
        let mut table = zero_table(K, BucketPolicy::default());
        for (i, bit) in [5usize, 100, 200].iter().enumerate() {
            let node = Node::with_id(id_with_bit(*bit), enode(31000 + i as u16));
            assert_eq!(table.insert(node), Insertion::Added);
        }

        for (index, bucket) in table.buckets().iter().enumerate() {
            let expected = usize::from(matches!(index, 5 | 100 | 200));
            assert_eq!(bucket.len(), expected, "bucket {}", index);
        }
        assert_eq!(table.node_count(), 3);
    }

    #[test]
    fn test_self_is_rejected() {
        let local = enode(30001);
        let mut table = RoutingTable::new(local.clone(), K, BucketPolicy::default(), 0);
        assert_eq!(table.add(local), Insertion::Rejected);
        assert_eq!(table.node_count(), 0);
    }

    #[test]
    fn test_duplicate_refreshes() {
        let mut table = zero_table(K, BucketPolicy::default());
        let peer = Node::with_id(id_with_bit(10), enode(31001));
        assert_eq!(table.insert(peer.clone()), Insertion::Added);
        assert_eq!(table.insert(peer), Insertion::Refreshed);
        assert_eq!(table.node_count(), 1);
    }

    #[test]
    fn test_full_bucket_drops_newcomer() {
        let mut table = zero_table(2, BucketPolicy::DropNewcomer);
        for i in 0..3u8 {
            let mut id = id_with_bit(0);
            id.0[31] = i;
            let outcome = table.insert(Node::with_id(id, enode(32000 + i as u16)));
            if i < 2 {
                assert_eq!(outcome, Insertion::Added);
            } else {
                assert_eq!(outcome, Insertion::Rejected);
            }
        }
        assert_eq!(table.bucket(0).unwrap().len(), 2);
    }

    #[test]
    fn test_full_bucket_evicts_oldest() {
        let mut table = zero_table(2, BucketPolicy::EvictOldest);
        let mut first = id_with_bit(0);
        first.0[31] = 1;
        let mut second = id_with_bit(0);
        second.0[31] = 2;
        let mut third = id_with_bit(0);
        third.0[31] = 3;

        table.insert(Node::with_id(first, enode(32100)));
        std::thread::sleep(Duration::from_millis(5));
        table.insert(Node::with_id(second, enode(32101)));

        match table.insert(Node::with_id(third, enode(32102))) {
            Insertion::Replaced(evicted) => assert_eq!(evicted.id, first),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(table.get(&first).is_none());
        assert!(table.get(&third).is_some());
    }

    #[test]
    fn test_k_closest_selection() {
        let mut table = RoutingTable::with_local(
            Node::with_id(EnodeId([0xFFu8; ID_BYTES]), enode(30002)),
            64,
            BucketPolicy::default(),
            0,
        );
        for b in 0x01..=0x28u8 {
            table.insert(Node::with_id(id_with_last_byte(b), enode(33000 + b as u16)));
        }
        assert_eq!(table.node_count(), 40);

        let target = id_with_last_byte(0x15);
        let closest = table.k_closest(&target, K);
        assert_eq!(closest.len(), K);

        let mut expected: Vec<u8> = (0x01..=0x28u8).collect();
        expected.sort_by_key(|b| b ^ 0x15);
        let got: Vec<u8> = closest.iter().map(|n| n.id.0[31]).collect();
        assert_eq!(got, expected[..K].to_vec());

        for pair in closest.windows(2) {
            assert!(xor(&pair[0].id, &target) <= xor(&pair[1].id, &target));
        }
    }

    #[test]
    fn test_k_closest_includes_self_in_small_table() {
        let mut table = zero_table(K, BucketPolicy::default());
        table.insert(Node::with_id(id_with_bit(0), enode(31002)));
        let closest = table.k_closest(&id_with_bit(255), K);
        assert_eq!(closest.len(), 2);
        assert_eq!(closest[0].id, table.local().id);
    }

    #[test]
    fn test_closest_falls_back_to_self() {
        let table = zero_table(K, BucketPolicy::default());
        assert_eq!(table.closest(&id_with_bit(7)).id, table.local().id);
    }

    #[test]
    fn test_evict_stale() {
        let mut table = zero_table(K, BucketPolicy::default());
        table.insert(Node::with_id(id_with_bit(3), enode(31003)));
        std::thread::sleep(Duration::from_millis(20));
        table.insert(Node::with_id(id_with_bit(4), enode(31004)));

        let evicted = table.evict_stale(Duration::from_millis(10));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, id_with_bit(3));
        assert_eq!(table.node_count(), 1);
    }

    #[test]
    fn test_record_ping() {
        let mut table = zero_table(K, BucketPolicy::default());
        let id = id_with_bit(9);
        table.insert(Node::with_id(id, enode(31005)));
        assert!(table.record_ping(&id, true));
        assert!(table.record_ping(&id, false));
        let node = table.get(&id).unwrap();
        assert_eq!((node.ping_ok, node.ping_total), (1, 2));
        assert!(!table.record_ping(&id_with_bit(1), true));
    }

    #[test]
    fn test_endpoint_index() {
        let mut table = zero_table(K, BucketPolicy::default());
        let peer = enode(34000);
        let id = id_with_bit(42);
        table.insert(Node::with_id(id, peer.clone()));
        assert_eq!(table.bucket_of(peer.udp_addr()), Some(42));
        assert_eq!(table.bucket_of("127.0.0.1:34001".parse().unwrap()), None);

        table.remove(&id);
        assert_eq!(table.bucket_of(peer.udp_addr()), None);
    }
}
