//! DHT main module
//!
//! Owns the routing table, answers queries from the inbound queue and runs
//! the maintenance tickers: refresh (PING + FIND_NODE to every peer), live
//! (evict silent peers) and persist (write peers to the store).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::dht::node::Node;
use crate::dht::routing::{BucketPolicy, Insertion, RoutingTable, K};
use crate::dht::store::KvStore;
use crate::error::P2pError;
use crate::identity::{Enode, EnodeId, IdGenerator};
use crate::protocol::message::Query;
use crate::queue::EventQueue;
use crate::rpc::{KadReply, KadRequest};

/// Key prefix for persisted peers
pub const ENODE_PREFIX: &str = "enode:";
/// Separator between enode URLs in a FIND_NODE reply
pub const NODE_SEPARATOR: char = '|';

/// DHT tuning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtConfig {
    pub k: usize,
    /// Outstanding refresh RPCs
    pub concurrency: usize,
    pub refresh_interval: Duration,
    pub live_interval: Duration,
    pub persist_interval: Duration,
    /// Silence after which a peer is evicted
    pub liveness: Duration,
    pub rpc_timeout: Duration,
    pub bucket_policy: BucketPolicy,
    pub zone: u16,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: K,
            concurrency: 50,
            refresh_interval: Duration::from_secs(10),
            live_interval: Duration::from_secs(30),
            persist_interval: Duration::from_secs(60),
            liveness: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(3),
            bucket_policy: BucketPolicy::default(),
            zone: 0,
        }
    }
}

/// Main DHT struct
pub struct Dht {
    local: Enode,
    table: Arc<RwLock<RoutingTable>>,
    store: Arc<dyn KvStore>,
    /// Queries received from the network
    inbound: Arc<EventQueue<KadRequest>>,
    /// Queries for the UDP client to send
    outbound: Arc<EventQueue<KadRequest>>,
    ids: Arc<dyn IdGenerator>,
    config: DhtConfig,
}

/// Store key for a peer
pub fn store_key(id: &EnodeId) -> String {
    format!("{}{}", ENODE_PREFIX, id.to_hex())
}

/// A query target: a 64-hex id or an enode URL
pub fn parse_target(payload: &[u8]) -> Result<EnodeId, P2pError> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| P2pError::protocol_error("target is not UTF-8"))?
        .trim();
    if text.is_empty() {
        return Err(P2pError::protocol_error("empty target"));
    }
    if let Some(id) = EnodeId::from_hex(text) {
        return Ok(id);
    }
    Ok(Enode::parse(text)?.id())
}

impl Dht {
    /// Build the table from `bootstrap` plus every peer persisted in `store`
    pub async fn new(
        local: Enode,
        bootstrap: Vec<Enode>,
        store: Arc<dyn KvStore>,
        inbound: Arc<EventQueue<KadRequest>>,
        outbound: Arc<EventQueue<KadRequest>>,
        ids: Arc<dyn IdGenerator>,
        config: DhtConfig,
    ) -> Result<Self> {
        let table = RoutingTable::new(local.clone(), config.k, config.bucket_policy, config.zone);
        let dht = Self {
            local,
            table: Arc::new(RwLock::new(table)),
            store,
            inbound,
            outbound,
            ids,
            config,
        };

        let stored = dht.load_stored().await?;
        let mut table = dht.table.write().await;
        for enode in bootstrap.into_iter().chain(stored) {
            if let Insertion::Rejected = table.add(enode.clone()) {
                debug!("Skipping seed {}", enode.id());
            }
        }
        info!("DHT {} seeded with {} nodes", dht.local.id(), table.node_count());
        drop(table);

        Ok(dht)
    }

    async fn load_stored(&self) -> Result<Vec<Enode>> {
        let entries = self.store.range(ENODE_PREFIX).await.map_err(|e| {
            error!("Failed to load stored peers: {}", e);
            P2pError::dht_error_full("Failed to load stored peers", "store", e.to_string())
        })?;

        let mut nodes = Vec::with_capacity(entries.len());
        for (key, url) in entries {
            match Enode::parse(&url) {
                Ok(enode) if key == store_key(&enode.id()) => nodes.push(enode),
                Ok(_) => warn!("Stored key {} does not match its enode", key),
                Err(e) => warn!("Ignoring stored peer {}: {}", key, e),
            }
        }
        Ok(nodes)
    }

    pub fn local(&self) -> &Enode {
        &self.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.config
    }

    pub async fn add_peer(&self, enode: Enode) -> Insertion {
        self.table.write().await.add(enode)
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.table.read().await.nodes()
    }

    pub async fn node_count(&self) -> usize {
        self.table.read().await.node_count()
    }

    pub async fn get(&self, id: &EnodeId) -> Option<Node> {
        self.table.read().await.get(id).cloned()
    }

    /// Bucket index of the peer whose UDP endpoint is `addr`
    pub async fn bucket_of(&self, addr: SocketAddr) -> Option<usize> {
        self.table.read().await.bucket_of(addr)
    }

    pub async fn find_node(&self, target: &EnodeId) -> Vec<Node> {
        self.table.read().await.k_closest(target, self.config.k)
    }

    pub async fn find_value(&self, target: &EnodeId) -> Node {
        self.table.read().await.closest(target)
    }

    /// Main DHT event loop
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Starting DHT event loop for {}", self.local.id());

        let mut refresh = ticker(self.config.refresh_interval);
        let mut live = ticker(self.config.live_interval);
        let mut persist = ticker(self.config.persist_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("DHT event loop stopped");
                    break;
                }
                _ = refresh.tick() => {
                    let span = info_span!("refresh", trace_id = %self.ids.generate());
                    tokio::spawn(self.clone().refresh(cancel.clone()).instrument(span));
                }
                _ = live.tick() => {
                    let evicted = self.live().await;
                    if !evicted.is_empty() {
                        info!("Evicted {} silent nodes", evicted.len());
                    }
                }
                _ = persist.tick() => {
                    let span = info_span!("persist", trace_id = %self.ids.generate());
                    if let Err(e) = self.persist().instrument(span).await {
                        warn!("Failed to persist nodes: {}", e);
                    }
                }
                request = self.inbound.pull() => match request {
                    Some(request) => {
                        let this = self.clone();
                        let span = info_span!("kad", trace_id = %request.trace_id, query = ?request.query);
                        tokio::spawn(async move { this.handle(request).await }.instrument(span));
                    }
                    None => {
                        warn!("Inbound queue closed");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Answer one query from the network
    pub async fn handle(&self, request: KadRequest) {
        let KadRequest {
            query, payload, reply, ..
        } = request;

        let answer: KadReply = match query {
            Query::Ping => self.handle_ping(&payload).await,
            Query::FindNode => self.handle_find_node(&payload).await,
            Query::FindValue => self.handle_find_value(&payload).await,
        };
        if let Err(e) = &answer {
            debug!("{:?} failed: {}", query, e);
        }
        if reply.send(answer).is_err() {
            debug!("{:?} requester went away", query);
        }
    }

    async fn handle_ping(&self, payload: &[u8]) -> KadReply {
        let url = std::str::from_utf8(payload).map_err(|_| P2pError::protocol_error("sender is not UTF-8"))?;
        let sender = Enode::parse(url.trim())?;
        let outcome = self.table.write().await.add(sender.clone());
        trace!("PING from {}: {:?}", sender.id(), outcome);
        Ok(Vec::new())
    }

    async fn handle_find_node(&self, payload: &[u8]) -> KadReply {
        let target = parse_target(payload)?;
        let closest = self.find_node(&target).await;
        let urls: Vec<&str> = closest.iter().map(|n| n.enode.url()).collect();
        trace!("FIND_NODE {} -> {} nodes", target, urls.len());
        Ok(urls.join(&NODE_SEPARATOR.to_string()).into_bytes())
    }

    async fn handle_find_value(&self, payload: &[u8]) -> KadReply {
        let target = parse_target(payload)?;
        let closest = self.find_value(&target).await;
        Ok(closest.enode.url().as_bytes().to_vec())
    }

    /// Send `query` to `target` through the outbound queue and wait for the reply
    pub async fn request(&self, query: Query, payload: Vec<u8>, target: &Enode) -> Result<Vec<u8>> {
        let (request, reply) = KadRequest::outbound(query, payload, target.clone(), self.ids.generate());
        if !self.outbound.push(request).await {
            return Err(P2pError::timeout(format!("{:?} to {} not queued", query, target.udp_addr()), "push").into());
        }

        match timeout(self.config.rpc_timeout, reply).await {
            Ok(Ok(answer)) => answer,
            Ok(Err(_)) => Err(P2pError::dht_error_with_node("reply dropped", target.udp_addr().to_string()).into()),
            Err(_) => {
                Err(P2pError::timeout(format!("{:?} to {}", query, target.udp_addr()), "rpc").into())
            }
        }
    }

    /// PING every peer and ask each for the nodes closest to us
    pub async fn refresh(self: Arc<Self>, cancel: CancellationToken) {
        let nodes = self.nodes().await;
        if nodes.is_empty() {
            trace!("Nothing to refresh");
            return;
        }
        debug!("Refreshing {} nodes", nodes.len());

        let limit = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();
        for node in nodes {
            for query in [Query::Ping, Query::FindNode] {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return,
                    permit = limit.clone().acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                };
                let this = self.clone();
                let node = node.clone();
                tasks.spawn(
                    async move {
                        match query {
                            Query::Ping => this.ping(&node).await,
                            _ => this.discover(&node).await,
                        }
                        drop(permit);
                    }
                    .in_current_span(),
                );
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Refresh task failed: {}", e);
            }
        }
    }

    async fn ping(&self, node: &Node) {
        let answered = match self.request(Query::Ping, self.local.url().as_bytes().to_vec(), &node.enode).await {
            Ok(_) => true,
            Err(e) => {
                debug!("PING {} failed: {}", node.enode.udp_addr(), e);
                false
            }
        };
        self.table.write().await.record_ping(&node.id, answered);
    }

    async fn discover(&self, node: &Node) {
        let reply = match self.request(Query::FindNode, self.local.url().as_bytes().to_vec(), &node.enode).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!("FIND_NODE {} failed: {}", node.enode.udp_addr(), e);
                return;
            }
        };

        let text = String::from_utf8_lossy(&reply);
        let found: Vec<Enode> = text
            .split(NODE_SEPARATOR)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match Enode::parse(s) {
                Ok(enode) => Some(enode),
                Err(e) => {
                    debug!("Ignoring returned node {}: {}", s, e);
                    None
                }
            })
            .collect();

        let mut table = self.table.write().await;
        let mut added = 0;
        for enode in found {
            if table.add(enode) == Insertion::Added {
                added += 1;
            }
        }
        if added > 0 {
            debug!("Learned {} nodes from {}", added, node.enode.udp_addr());
        }
    }

    /// Evict every peer silent for longer than the liveness window
    pub async fn live(&self) -> Vec<Node> {
        let evicted = self.table.write().await.evict_stale(self.config.liveness);
        for node in &evicted {
            debug!("Evicting {} ({})", node.id, node.enode.udp_addr());
        }
        evicted
    }

    /// Write every peer to the store and prune keys of departed peers
    pub async fn persist(&self) -> Result<()> {
        let nodes = self.nodes().await;
        let mut keep = HashSet::with_capacity(nodes.len());

        for node in &nodes {
            let key = store_key(&node.enode.id());
            self.store.put(&key, node.enode.url()).await?;
            keep.insert(key);
        }

        let mut pruned = 0;
        for (key, _) in self.store.range(ENODE_PREFIX).await? {
            if !keep.contains(&key) {
                self.store.delete(&key).await?;
                pruned += 1;
            }
        }
        debug!("Persisted {} nodes, pruned {}", keep.len(), pruned);
        Ok(())
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
