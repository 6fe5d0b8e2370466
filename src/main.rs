//! kad-p2p - Main entry point
//!
//! Runs one discovery node and, optionally, the authenticated TCP echo service.

use anyhow::{Context, Result};
use kad_p2p::{
    CliArgs, Config, CurveKind, EchoHandler, FileStore, KvStore, LogFormat, MemoryStore, P2pError, P2pNode, PrivateKey,
    Supervisor, TcpServer,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Period of the queue and table report
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Set up panic handler for unexpected errors
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!(
                "PANIC occurred at {}:{}:{}",
                location.file(),
                location.line(),
                location.column()
            ),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_panic_handler();

    let args = CliArgs::parse_args();
    let config = Config::from_args(&args).context("Failed to load configuration")?;
    init_logging(&config);
    debug!("CLI arguments: {:?}", args);

    config.validate().context("Invalid configuration")?;
    info!("{} starting", config.app.name);

    let key = load_key(&args)?;
    let store = open_store(&args).await?;
    let ids = config.id_generator();

    let node = Arc::new(
        P2pNode::bind(key, config.bootstrap()?, store, ids.clone(), config.p2p_config())
            .await
            .context("Failed to start node")?,
    );
    println!("{}", node.local().url());

    let mut supervisor = Supervisor::new();
    let token = supervisor.token();

    supervisor.spawn("p2p", {
        let node = node.clone();
        let token = token.clone();
        async move { node.run(token).await }
    });

    if args.serve_tcp {
        let addr: SocketAddr = config.tcp_listen_addr().parse().context("Invalid TCP listen address")?;
        let server = Arc::new(TcpServer::new(
            node.local().clone(),
            config.transport_config(),
            Arc::new(EchoHandler),
            ids,
        )?);
        supervisor.spawn("tcp", server.run(addr, token.clone()));
    }

    supervisor.spawn("monitor", monitor(node, token));

    supervisor.run().await?;
    info!("{} finished", config.app.name);
    Ok(())
}

/// Initialize logging from the configured level and format
fn init_logging(config: &Config) {
    let level = config.log_level().unwrap_or(tracing::Level::INFO);

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match config.log.format {
        LogFormat::Pretty => subscriber.pretty().init(),
        LogFormat::Compact => subscriber.compact().init(),
        LogFormat::Json => subscriber.json().init(),
    }

    debug!("Logging initialized with level {}", level);
}

/// Node key from `--key`, or a fresh P-256 key
fn load_key(args: &CliArgs) -> Result<PrivateKey> {
    let Some(path) = &args.key else {
        info!("No key given, generating a fresh P-256 key");
        return Ok(PrivateKey::generate(CurveKind::P256));
    };

    let pem = std::fs::read_to_string(path).map_err(|e| {
        error!("Failed to read key file '{}': {}", path.display(), e);
        anyhow::anyhow!("Failed to read key file: {}", e)
    })?;
    let key = PrivateKey::from_pem(&pem).map_err(|e| {
        error!("Failed to parse key file '{}': {}", path.display(), e);
        anyhow::Error::from(P2pError::config_error_with_field(e.to_string(), "key"))
    })?;
    Ok(key)
}

async fn open_store(args: &CliArgs) -> Result<Arc<dyn KvStore>> {
    match &args.store {
        Some(path) => {
            info!("Persisting peers to {}", path.display());
            Ok(Arc::new(FileStore::open(path).await?))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Periodic report of the routing table size and queue usage
async fn monitor(node: Arc<P2pNode>, cancel: tokio_util::sync::CancellationToken) -> Result<()> {
    let mut ticker = interval(MONITOR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let stats = node.stats().await;
                info!(
                    "nodes={} dht_queue={}/{} udp_queue={}/{} dropped={}",
                    stats.nodes,
                    stats.inbound.len,
                    stats.inbound.capacity,
                    stats.outbound.len,
                    stats.outbound.capacity,
                    stats.inbound.dropped + stats.outbound.dropped
                );
            }
        }
    }
    Ok(())
}
