//! Authenticated TCP client
//!
//! Dials an enode's TCP endpoint, runs the initiator handshake, checks that
//! the responder holds the enode's key and keeps the session alive with
//! PING frames.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::P2pError;
use crate::identity::{Enode, IdGenerator};
use crate::protocol::frame::{Frame, FrameCodec};
use crate::protocol::handshake::Ecdhe;
use crate::transport::session::Session;
use crate::transport::TransportConfig;

/// Client side of an authenticated session
pub struct TcpClient {
    session: Arc<Session>,
    remote: Enode,
}

impl TcpClient {
    /// Connect to `remote` as `local`
    pub async fn connect(
        local: Enode,
        remote: &Enode,
        config: TransportConfig,
        ids: Arc<dyn IdGenerator>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let ecdhe = Ecdhe::new(local)?;
        let addr = remote.tcp_addr();
        info!("Connecting to {}", addr);

        let mut stream = timeout(config.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                warn!("Connection timeout to {}", addr);
                P2pError::timeout(format!("connect to {}", addr), "connect")
            })?
            .map_err(|e| {
                error!("Failed to connect to {}: {}", addr, e);
                P2pError::network_error_full("Failed to connect", addr.to_string(), e.to_string())
            })?;

        let secrets = timeout(config.handshake_timeout, ecdhe.initiate(&mut stream, remote))
            .await
            .map_err(|_| {
                warn!("Handshake timeout with {}", addr);
                P2pError::timeout(format!("handshake with {}", addr), "handshake")
            })?
            .map_err(|e| {
                error!("Handshake with {} failed: {}", addr, e);
                e
            })?;

        let codec = FrameCodec::with_max_frame_size(secrets, config.max_frame_size)?;
        let heartbeat_interval = config.heartbeat_interval;
        let session = Session::spawn(stream, codec, addr.to_string(), ids, config, cancel);
        tokio::spawn(heartbeat(Arc::downgrade(&session), heartbeat_interval));

        debug!("Session with {} established", addr);
        Ok(Self {
            session,
            remote: remote.clone(),
        })
    }

    pub fn remote(&self) -> &Enode {
        &self.remote
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub async fn send(&self, data: Vec<u8>) -> Result<u64> {
        self.session.send(data).await
    }

    pub async fn receive(&self) -> Result<Frame> {
        self.session.receive().await
    }

    pub async fn request_reply(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(self.session.request_reply(data).await?.data)
    }

    pub async fn ping(&self) -> Result<()> {
        self.session.ping().await
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.session.close();
    }
}

/// PING every `period`; a missing PONG closes the session
async fn heartbeat(session: std::sync::Weak<Session>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let session = match session.upgrade() {
            Some(session) => session,
            None => break,
        };
        if session.is_closed() {
            break;
        }
        if let Err(e) = session.ping().await {
            warn!("Heartbeat to {} failed, closing session: {}", session.peer(), e);
            session.close();
            break;
        }
    }
}
