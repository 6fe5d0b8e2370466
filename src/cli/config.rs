//! CLI configuration module
//!
//! JSON configuration file with CLI overlays, projected into the runtime
//! option structs of the node.

use crate::cli::args::{CliArgs, LogFormat};
use crate::dht::{BucketPolicy, DhtConfig, K};
use crate::identity::{Enode, IdGenerator, SequenceIdGenerator, SnowflakeIdGenerator};
use crate::queue::{QueueConfig, DEFAULT_CAPACITY, DEFAULT_PUSH_TIMEOUT};
use crate::service::P2pConfig;
use crate::transport::TransportConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Default port for both UDP and TCP
pub const DEFAULT_PORT: u16 = 30303;

/// Source of frame and trace ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGeneratorKind {
    #[default]
    Sequence,
    /// Time-ordered ids tagged with the UDP port
    Snowflake,
}

/// Node identity and endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub host: String,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub zone: u16,
    pub id_generator: IdGeneratorKind,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "kad-p2p".to_string(),
            host: "127.0.0.1".to_string(),
            tcp_port: DEFAULT_PORT,
            udp_port: DEFAULT_PORT,
            zone: 0,
            id_generator: IdGeneratorKind::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtSection {
    pub k: usize,
    pub concurrency: usize,
    pub refresh_secs: u64,
    pub live_secs: u64,
    pub persist_secs: u64,
    pub liveness_secs: u64,
    pub rpc_timeout_secs: u64,
    pub bucket_policy: BucketPolicy,
    pub bootstrap: Vec<String>,
}

impl Default for DhtSection {
    fn default() -> Self {
        let dht = DhtConfig::default();
        Self {
            k: K,
            concurrency: dht.concurrency,
            refresh_secs: dht.refresh_interval.as_secs(),
            live_secs: dht.live_interval.as_secs(),
            persist_secs: dht.persist_interval.as_secs(),
            liveness_secs: dht.liveness.as_secs(),
            rpc_timeout_secs: dht.rpc_timeout.as_secs(),
            bucket_policy: BucketPolicy::default(),
            bootstrap: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub capacity: usize,
    pub push_timeout_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            push_timeout_ms: DEFAULT_PUSH_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSection {
    pub max_frame_size: usize,
    pub request_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub heartbeat_secs: u64,
}

impl Default for TransportSection {
    fn default() -> Self {
        let transport = TransportConfig::default();
        Self {
            max_frame_size: transport.max_frame_size,
            request_timeout_secs: transport.request_timeout.as_secs(),
            handshake_timeout_secs: transport.handshake_timeout.as_secs(),
            heartbeat_secs: transport.heartbeat_interval.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Configuration for the node binary
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub app: AppSection,
    pub dht: DhtSection,
    pub queue: QueueSection,
    pub transport: TransportSection,
    pub log: LogSection,
}

impl Config {
    /// Read a JSON configuration file; missing sections take defaults
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Create configuration from CLI arguments, layered over `--config` when given
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(host) = &args.host {
            config.app.host = host.clone();
        }
        if let Some(port) = args.tcp_port {
            config.app.tcp_port = port;
        }
        if let Some(port) = args.udp_port {
            config.app.udp_port = port;
        }
        if let Some(zone) = args.zone {
            config.app.zone = zone;
        }
        config.dht.bootstrap.extend(args.bootstrap.iter().cloned());
        if let Some(format) = args.log_format {
            config.log.format = format;
        }
        if args.verbose || args.quiet {
            config.log.level = args.log_level().to_string().to_lowercase();
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.app.host.parse::<IpAddr>().is_err() {
            return Err(anyhow::anyhow!("host must be an IP address, got {}", self.app.host));
        }

        if self.app.tcp_port == 0 || self.app.udp_port == 0 {
            return Err(anyhow::anyhow!("Ports cannot be 0"));
        }

        if self.dht.k == 0 {
            return Err(anyhow::anyhow!("k must be at least 1"));
        }

        if self.dht.concurrency == 0 {
            return Err(anyhow::anyhow!("concurrency must be at least 1"));
        }

        let intervals = [
            ("refresh_secs", self.dht.refresh_secs),
            ("live_secs", self.dht.live_secs),
            ("persist_secs", self.dht.persist_secs),
            ("liveness_secs", self.dht.liveness_secs),
            ("rpc_timeout_secs", self.dht.rpc_timeout_secs),
            ("push_timeout_ms", self.queue.push_timeout_ms),
            ("request_timeout_secs", self.transport.request_timeout_secs),
            ("handshake_timeout_secs", self.transport.handshake_timeout_secs),
            ("heartbeat_secs", self.transport.heartbeat_secs),
        ];
        if let Some((name, _)) = intervals.iter().find(|(_, value)| *value == 0) {
            return Err(anyhow::anyhow!("{} must be greater than 0", name));
        }

        if self.queue.capacity == 0 {
            return Err(anyhow::anyhow!("queue capacity must be at least 1"));
        }

        if self.transport.max_frame_size == 0 {
            return Err(anyhow::anyhow!("max_frame_size must be at least 1"));
        }

        if self.log_level().is_none() {
            return Err(anyhow::anyhow!("Unknown log level {}", self.log.level));
        }

        for raw in &self.dht.bootstrap {
            Enode::parse(raw).map_err(|e| anyhow::anyhow!("Invalid bootstrap enode {}: {}", raw, e))?;
        }

        Ok(())
    }

    /// Parsed bootstrap enodes
    pub fn bootstrap(&self) -> Result<Vec<Enode>> {
        self.dht
            .bootstrap
            .iter()
            .map(|raw| Enode::parse(raw).map_err(|e| anyhow::anyhow!("Invalid bootstrap enode {}: {}", raw, e)))
            .collect()
    }

    /// Id generator shared by the node and the TCP service
    pub fn id_generator(&self) -> Arc<dyn IdGenerator> {
        match self.app.id_generator {
            IdGeneratorKind::Sequence => Arc::new(SequenceIdGenerator::new()),
            IdGeneratorKind::Snowflake => Arc::new(SnowflakeIdGenerator::new(self.app.udp_port as u64)),
        }
    }

    pub fn log_level(&self) -> Option<tracing::Level> {
        self.log.level.parse().ok()
    }

    pub fn dht_config(&self) -> DhtConfig {
        DhtConfig {
            k: self.dht.k,
            concurrency: self.dht.concurrency,
            refresh_interval: Duration::from_secs(self.dht.refresh_secs),
            live_interval: Duration::from_secs(self.dht.live_secs),
            persist_interval: Duration::from_secs(self.dht.persist_secs),
            liveness: Duration::from_secs(self.dht.liveness_secs),
            rpc_timeout: Duration::from_secs(self.dht.rpc_timeout_secs),
            bucket_policy: self.dht.bucket_policy,
            zone: self.app.zone,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.queue.capacity,
            push_timeout: Duration::from_millis(self.queue.push_timeout_ms),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            max_frame_size: self.transport.max_frame_size,
            request_timeout: Duration::from_secs(self.transport.request_timeout_secs),
            handshake_timeout: Duration::from_secs(self.transport.handshake_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.transport.heartbeat_secs),
            ..TransportConfig::default()
        }
    }

    pub fn p2p_config(&self) -> P2pConfig {
        P2pConfig {
            host: self.app.host.clone(),
            tcp_port: self.app.tcp_port,
            udp_port: self.app.udp_port,
            dht: self.dht_config(),
            queue: self.queue_config(),
            reply_timeout: Duration::from_secs(self.dht.rpc_timeout_secs),
        }
    }

    /// Get the TCP listen address
    pub fn tcp_listen_addr(&self) -> String {
        format!("{}:{}", self.app.host, self.app.tcp_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_constants() {
        let config = Config::default();
        assert_eq!(config.dht.k, 20);
        assert_eq!(config.dht.concurrency, 50);
        assert_eq!(config.dht.refresh_secs, 10);
        assert_eq!(config.dht.live_secs, 30);
        assert_eq!(config.dht.persist_secs, 60);
        assert_eq!(config.queue.capacity, 1024);
        assert_eq!(config.queue.push_timeout_ms, 2000);
        assert_eq!(config.dht_config(), DhtConfig::default());
        assert_eq!(config.transport_config(), TransportConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"app": {{"udp_port": 4000}}, "dht": {{"k": 8, "bucket_policy": "evict_oldest"}}, "log": {{"format": "json"}}}}"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.app.udp_port, 4000);
        assert_eq!(config.app.tcp_port, DEFAULT_PORT);
        assert_eq!(config.dht.k, 8);
        assert_eq!(config.dht.bucket_policy, BucketPolicy::EvictOldest);
        assert_eq!(config.dht.refresh_secs, 10);
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn test_load_garbage_fails() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_config_from_args() {
        let args = CliArgs {
            host: Some("10.1.2.3".to_string()),
            udp_port: Some(4001),
            zone: Some(0x20),
            log_format: Some(LogFormat::Compact),
            verbose: true,
            ..Default::default()
        };

        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.app.host, "10.1.2.3");
        assert_eq!(config.app.udp_port, 4001);
        assert_eq!(config.app.tcp_port, DEFAULT_PORT);
        assert_eq!(config.dht_config().zone, 0x20);
        assert_eq!(config.log.format, LogFormat::Compact);
        assert_eq!(config.log_level(), Some(tracing::Level::DEBUG));
        assert_eq!(config.tcp_listen_addr(), format!("10.1.2.3:{}", DEFAULT_PORT));
    }

    #[test]
    fn test_config_validate_rejects() {
        let mut config = Config::default();
        config.app.udp_port = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dht.k = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dht.refresh_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.app.host = "example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.queue.capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.dht.bootstrap.push("http://nope".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_snowflake_id_generator() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"app": {{"udp_port": 4002, "id_generator": "snowflake"}}}}"#).unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.app.id_generator, IdGeneratorKind::Snowflake);

        let ids = config.id_generator();
        let first = ids.generate();
        let second = ids.generate();
        assert!(second > first);
        // node bits carry the low ten bits of the UDP port
        assert_eq!((first >> 12) & 0x3ff, 4002 & 0x3ff);
    }

    #[test]
    fn test_sequence_id_generator_default() {
        let ids = Config::default().id_generator();
        let first = ids.generate();
        assert_eq!(ids.generate(), first + 1);
    }

    #[test]
    fn test_queue_projection() {
        let mut config = Config::default();
        config.queue.push_timeout_ms = 250;
        let queue = config.queue_config();
        assert_eq!(queue.push_timeout, Duration::from_millis(250));
        assert_eq!(queue.capacity, DEFAULT_CAPACITY);
    }
}
