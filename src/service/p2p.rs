//! P2P node
//!
//! One node = a DHT fed by two event queues, a KadRPC server answering on
//! the UDP port and a KadRPC client dialing out for the DHT.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::crypto::PrivateKey;
use crate::dht::{Dht, DhtConfig, KvStore};
use crate::error::P2pError;
use crate::identity::{Enode, IdGenerator};
use crate::queue::{EventQueue, QueueConfig, QueueStats};
use crate::rpc::server::REPLY_TIMEOUT;
use crate::rpc::{KadClient, KadRequest, KadServer};

/// Node options
#[derive(Debug, Clone)]
pub struct P2pConfig {
    pub host: String,
    /// 0 reuses the UDP port
    pub tcp_port: u16,
    /// 0 picks an ephemeral port
    pub udp_port: u16,
    pub dht: DhtConfig,
    pub queue: QueueConfig,
    /// How long the UDP server waits for the DHT to answer
    pub reply_timeout: Duration,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            tcp_port: 0,
            udp_port: 0,
            dht: DhtConfig::default(),
            queue: QueueConfig::default(),
            reply_timeout: REPLY_TIMEOUT,
        }
    }
}

/// Snapshot reported by the monitor
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: String,
    pub nodes: usize,
    pub inbound: QueueStats,
    pub outbound: QueueStats,
}

pub struct P2pNode {
    local: Enode,
    dht: Arc<Dht>,
    server: Arc<KadServer>,
    client: Arc<KadClient>,
    inbound: Arc<EventQueue<KadRequest>>,
    outbound: Arc<EventQueue<KadRequest>>,
}

impl P2pNode {
    /// Bind the UDP port and build the DHT; nothing runs until [`P2pNode::run`]
    pub async fn bind(
        key: PrivateKey,
        bootstrap: Vec<Enode>,
        store: Arc<dyn KvStore>,
        ids: Arc<dyn IdGenerator>,
        config: P2pConfig,
    ) -> Result<Self> {
        let inbound = Arc::new(EventQueue::new("dht", config.queue.clone()));
        let outbound = Arc::new(EventQueue::new("udp", config.queue.clone()));

        let addr: SocketAddr = format!("{}:{}", config.host, config.udp_port).parse().map_err(|e| {
            error!("Invalid listen address {}:{}: {}", config.host, config.udp_port, e);
            P2pError::config_error_with_field(format!("Invalid listen address: {}", e), "host")
        })?;
        let server = KadServer::bind(addr, inbound.clone(), ids.clone(), config.reply_timeout).await?;
        let udp_port = server.local_addr()?.port();
        let tcp_port = if config.tcp_port == 0 { udp_port } else { config.tcp_port };

        let local = Enode::from_private_key(key, &config.host, tcp_port, udp_port)?;
        info!("Local node {}", local.url());

        let client = KadClient::new(outbound.clone(), config.dht.rpc_timeout);
        let dht = Dht::new(
            local.clone(),
            bootstrap,
            store,
            inbound.clone(),
            outbound.clone(),
            ids,
            config.dht,
        )
        .await?;

        Ok(Self {
            local,
            dht: Arc::new(dht),
            server: Arc::new(server),
            client: Arc::new(client),
            inbound,
            outbound,
        })
    }

    pub fn local(&self) -> &Enode {
        &self.local
    }

    pub fn dht(&self) -> &Arc<Dht> {
        &self.dht
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        self.server.local_addr()
    }

    pub async fn stats(&self) -> NodeStats {
        NodeStats {
            id: self.local.id().to_hex(),
            nodes: self.dht.node_count().await,
            inbound: self.inbound.stats(),
            outbound: self.outbound.stats(),
        }
    }

    /// Run the DHT, server and client until `cancel` fires or one of them fails
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(self.dht.clone().run(cancel.clone()));
        tasks.spawn(self.server.clone().serve(cancel.clone()));
        tasks.spawn(self.client.clone().run(cancel.clone()));

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| anyhow::Error::from(P2pError::lifecycle_error_with_source("P2P task panicked", e.to_string())))
                .and_then(|r| r);
            if let Err(e) = outcome {
                error!("P2P task failed: {:#}", e);
                cancel.cancel();
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        info!("P2P node {} stopped", self.local.id());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::CurveKind;
    use crate::dht::MemoryStore;
    use crate::identity::SequenceIdGenerator;

    async fn node(bootstrap: Vec<Enode>) -> P2pNode {
        P2pNode::bind(
            PrivateKey::generate(CurveKind::P256),
            bootstrap,
            Arc::new(MemoryStore::new()),
            Arc::new(SequenceIdGenerator::new()),
            P2pConfig::default(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_bind_picks_ports() {
        let node = node(Vec::new()).await;
        let port = node.udp_addr().unwrap().port();
        assert_ne!(port, 0);
        assert_eq!(node.local().udp_port(), port);
        assert_eq!(node.local().tcp_port(), port);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let seed = node(Vec::new()).await;
        let node = node(vec![seed.local().clone()]).await;
        let stats = node.stats().await;
        assert_eq!(stats.nodes, 1);
        assert_eq!(stats.inbound.len, 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["id"], node.local().id().to_hex());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let node = node(Vec::new()).await;
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(2), node.run(cancel))
            .await
            .unwrap()
            .unwrap();
    }
}
