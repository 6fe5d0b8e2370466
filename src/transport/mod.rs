//! Transport module
//!
//! Multiplexed authenticated sessions over TCP: the session loops, the
//! accepting server and the dialing client.

use std::time::Duration;

use crate::protocol::frame::DEFAULT_MAX_FRAME_SIZE;

pub mod client;
pub mod server;
pub mod session;

pub use client::TcpClient;
pub use server::{EchoHandler, FrameHandler, TcpServer};
pub use session::Session;

/// Buffered frames per direction
pub const CHANNEL_CAPACITY: usize = 1024;

/// Runtime options for sessions, servers and clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Largest payload per frame
    pub max_frame_size: usize,
    /// Deadline for `request_reply`
    pub request_timeout: Duration,
    /// Deadline for the whole handshake
    pub handshake_timeout: Duration,
    /// Client PING period
    pub heartbeat_interval: Duration,
    /// Capacity of the read-in and write-out channels
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            request_timeout: Duration::from_secs(3),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(1),
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

/// Accept retry delay: 5 ms, doubling, capped at 1 s
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    delay: Duration,
}

impl Backoff {
    const MIN: Duration = Duration::from_millis(5);
    const MAX: Duration = Duration::from_secs(1);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delay(&mut self) -> Duration {
        self.delay = if self.delay < Self::MIN {
            Self::MIN
        } else {
            (self.delay * 2).min(Self::MAX)
        };
        self.delay
    }

    pub fn reset(&mut self) {
        self.delay = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..10).map(|_| backoff.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.max_frame_size, 1 << 16);
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.channel_capacity, 1024);
    }
}
