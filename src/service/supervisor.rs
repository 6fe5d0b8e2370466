//! Lifecycle supervisor
//!
//! Owns the root cancellation token. OS signals cancel it, and so does any
//! supervised task that fails. After cancellation the supervisor waits a
//! drain period so loops can observe the token, then returns.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::P2pError;

/// Time given to loops to exit after cancellation
pub const DRAIN_PERIOD: Duration = Duration::from_secs(1);

pub struct Supervisor {
    cancel: CancellationToken,
    drain: Duration,
    tasks: JoinSet<()>,
    failures_tx: mpsc::UnboundedSender<(&'static str, String)>,
    failures_rx: mpsc::UnboundedReceiver<(&'static str, String)>,
    listen_for_signals: bool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            cancel: CancellationToken::new(),
            drain: DRAIN_PERIOD,
            tasks: JoinSet::new(),
            failures_tx,
            failures_rx,
            listen_for_signals: true,
        }
    }

    pub fn with_drain(mut self, drain: Duration) -> Self {
        self.drain = drain;
        self
    }

    /// Do not install SIGINT/SIGTERM handlers
    pub fn without_signals(mut self) -> Self {
        self.listen_for_signals = false;
        self
    }

    /// Root token; cancel it to stop everything
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run `task` until it returns; an error cancels the root token
    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        let failures = self.failures_tx.clone();
        self.tasks.spawn(async move {
            match task.await {
                Ok(()) => info!("{} finished", name),
                Err(e) => {
                    error!("{} failed: {:#}", name, e);
                    let _ = failures.send((name, e.to_string()));
                    cancel.cancel();
                }
            }
        });
    }

    /// Block until cancellation, drain, then report the first task failure
    pub async fn run(mut self) -> Result<()> {
        if self.listen_for_signals {
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = shutdown_signal() => {
                        info!("Shutdown signal received");
                        cancel.cancel();
                    }
                }
            });
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                joined = self.tasks.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        error!("Supervised task panicked: {}", e);
                        self.cancel.cancel();
                    }
                    None => {
                        info!("All supervised tasks finished");
                        self.cancel.cancel();
                    }
                }
            }
        }

        info!("Shutting down, draining for {:?}", self.drain);
        sleep(self.drain).await;
        if !self.tasks.is_empty() {
            warn!("{} tasks still running after drain, aborting", self.tasks.len());
        }
        self.tasks.shutdown().await;

        match self.failures_rx.try_recv() {
            Ok((name, reason)) => Err(P2pError::lifecycle_error_with_source(format!("{} failed", name), reason).into()),
            Err(_) => Ok(()),
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on unix
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
