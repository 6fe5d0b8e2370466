//! Event queue
//!
//! An ordered, bounded channel with a push deadline. A push that cannot be
//! queued before the deadline is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{trace, warn};

pub const DEFAULT_CAPACITY: usize = 1024;
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Queue sizing and load-shedding options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub capacity: usize,
    pub push_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub len: usize,
    pub capacity: usize,
    #[serde(with = "millis")]
    pub push_timeout: Duration,
    pub dropped: u64,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }
}

/// Multi-producer queue with a single shared read end
pub struct EventQueue<T> {
    name: &'static str,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    config: QueueConfig,
    dropped: AtomicU64,
}

impl<T: Send> EventQueue<T> {
    pub fn new(name: &'static str, config: QueueConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
            config,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Enqueue `msg`, giving up after the push timeout.
    ///
    /// Returns `false` when the message was dropped.
    pub async fn push(&self, msg: T) -> bool {
        match timeout(self.config.push_timeout, self.tx.send(msg)).await {
            Ok(Ok(())) => {
                trace!("Queued message on {}", self.name);
                true
            }
            Ok(Err(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Queue {} is closed, dropping message", self.name);
                false
            }
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Queue {} full for {:?}, dropping message",
                    self.name, self.config.push_timeout
                );
                false
            }
        }
    }

    /// Next message in push order. Cancel safe, so it can sit in a `select!`.
    pub async fn pull(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            len: self.config.capacity.max(1) - self.tx.capacity(),
            capacity: self.config.capacity.max(1),
            push_timeout: self.config.push_timeout,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_pull_in_order() {
        let queue = EventQueue::new("test", QueueConfig::default());
        for i in 0..10u32 {
            assert!(queue.push(i).await);
        }
        for i in 0..10u32 {
            assert_eq!(queue.pull().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_after_timeout() {
        let queue = EventQueue::new(
            "tiny",
            QueueConfig {
                capacity: 1,
                push_timeout: Duration::from_millis(20),
            },
        );
        assert!(queue.push(1u8).await);
        assert!(!queue.push(2u8).await);

        let stats = queue.stats();
        assert_eq!(stats.len, 1);
        assert_eq!(stats.capacity, 1);
        assert_eq!(stats.dropped, 1);

        assert_eq!(queue.pull().await, Some(1));
        assert_eq!(queue.stats().len, 0);
    }

    #[tokio::test]
    async fn test_stats_defaults() {
        let queue: EventQueue<()> = EventQueue::new("defaults", QueueConfig::default());
        let stats = queue.stats();
        assert_eq!(stats.capacity, 1024);
        assert_eq!(stats.push_timeout, Duration::from_secs(2));
        assert_eq!(stats.dropped, 0);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["push_timeout"], 2000);
    }

    #[tokio::test]
    async fn test_pull_in_select() {
        let queue = EventQueue::new("select", QueueConfig::default());
        queue.push("hello").await;
        let got = tokio::select! {
            msg = queue.pull() => msg,
            _ = tokio::time::sleep(Duration::from_secs(1)) => None,
        };
        assert_eq!(got, Some("hello"));
    }
}
