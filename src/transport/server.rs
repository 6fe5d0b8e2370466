//! Authenticated TCP server
//!
//! Accepts connections, runs the responder side of the handshake under a
//! deadline and hands every application frame to a [`FrameHandler`]. The
//! handler's answer goes back under the request's frame id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::crypto::ecies::PublicKey;
use crate::error::P2pError;
use crate::identity::{Enode, IdGenerator};
use crate::protocol::frame::FrameCodec;
use crate::protocol::handshake::Ecdhe;
use crate::transport::session::Session;
use crate::transport::{Backoff, TransportConfig};

/// Application logic behind the server
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Answer one request from the authenticated `peer`
    async fn handle(&self, peer: &PublicKey, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// Replies with the request payload
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

#[async_trait]
impl FrameHandler for EchoHandler {
    async fn handle(&self, _peer: &PublicKey, data: Vec<u8>) -> Result<Vec<u8>> {
        Ok(data)
    }
}

/// TCP server speaking the authenticated frame protocol
pub struct TcpServer {
    ecdhe: Ecdhe,
    config: TransportConfig,
    handler: Arc<dyn FrameHandler>,
    ids: Arc<dyn IdGenerator>,
    /// Live sessions by id
    sessions: Arc<RwLock<HashMap<u64, Arc<Session>>>>,
}

impl TcpServer {
    pub fn new(
        local: Enode,
        config: TransportConfig,
        handler: Arc<dyn FrameHandler>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self> {
        Ok(Self {
            ecdhe: Ecdhe::new(local)?,
            config,
            handler,
            ids,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            error!("Failed to bind TCP listener on {}: {}", addr, e);
            P2pError::lifecycle_error_with_source(format!("Failed to listen on {}", addr), e.to_string())
        })?;
        Ok(listener)
    }

    /// Bind `addr` and serve until `cancel` fires
    pub async fn run(self: Arc<Self>, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
        let listener = Self::bind(addr).await?;
        self.serve(listener, cancel).await
    }

    /// Accept loop with exponential backoff on accept errors
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let local_addr = listener.local_addr()?;
        info!("TCP server listening on {}", local_addr);
        let mut backoff = Backoff::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("TCP server on {} stopping", local_addr);
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        let server = self.clone();
                        let cancel = cancel.clone();
                        let span = info_span!("tcp_conn", trace_id = %self.ids.generate(), peer = %peer);
                        tokio::spawn(server.handle_connection(stream, peer, cancel).instrument(span));
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!("Accept failed on {}: {}, retrying in {:?}", local_addr, e, delay);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(delay) => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let (secrets, remote) = match timeout(self.config.handshake_timeout, self.ecdhe.respond(&mut stream)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!("Handshake with {} failed: {}", peer, e);
                return;
            }
            Err(_) => {
                warn!("Handshake with {} timed out", peer);
                return;
            }
        };

        let codec = match FrameCodec::with_max_frame_size(secrets, self.config.max_frame_size) {
            Ok(codec) => codec,
            Err(e) => {
                error!("Failed to build frame codec for {}: {}", peer, e);
                return;
            }
        };

        let session_id = self.ids.generate();
        let session = Session::spawn(stream, codec, peer.to_string(), self.ids.clone(), self.config.clone(), &cancel);
        self.sessions.write().await.insert(session_id, session.clone());
        info!("Session {:016x} established with {}", session_id, peer);

        while let Ok(frame) = session.receive().await {
            let handler = self.handler.clone();
            let session = session.clone();
            let remote = remote.clone();
            tokio::spawn(
                async move {
                    let answer = match handler.handle(&remote, frame.data).await {
                        Ok(answer) => answer,
                        Err(e) => e.to_string().into_bytes(),
                    };
                    if let Err(e) = session.reply(frame.id, answer).await {
                        debug!("Dropping reply {:016x}: {}", frame.id, e);
                    }
                }
                .in_current_span(),
            );
        }

        self.sessions.write().await.remove(&session_id);
        info!("Session {:016x} with {} closed", session_id, peer);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}
