//! KadRPC UDP client
//!
//! Drains the DHT's outbound queue. Each request gets its own ephemeral
//! socket: send one envelope, read one reply, hand the payload back.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::error::P2pError;
use crate::identity::Enode;
use crate::protocol::message::{KadPacket, MessageType, Query, MAX_PACKET_SIZE};
use crate::queue::EventQueue;
use crate::rpc::KadRequest;

/// Dials the targets of outbound DHT queries
pub struct KadClient {
    outbound: Arc<EventQueue<KadRequest>>,
    reply_timeout: Duration,
}

impl KadClient {
    pub fn new(outbound: Arc<EventQueue<KadRequest>>, reply_timeout: Duration) -> Self {
        Self {
            outbound,
            reply_timeout,
        }
    }

    /// Dispatch loop; runs until `cancel` fires
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("KadRPC client started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("KadRPC client stopping");
                    break;
                }
                request = self.outbound.pull() => match request {
                    Some(request) => {
                        let client = self.clone();
                        let span = info_span!("kad_dial", trace_id = %request.trace_id, query = ?request.query);
                        tokio::spawn(async move { client.dial(request).await }.instrument(span));
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Send one queued request and deliver its reply
    pub async fn dial(&self, request: KadRequest) {
        let KadRequest {
            query,
            payload,
            enode,
            reply,
            ..
        } = request;

        let result = match enode {
            Some(enode) => self.exchange(query, payload, &enode).await,
            None => Err(P2pError::validation_error_with_field("request without target", "enode").into()),
        };
        if let Err(e) = &result {
            debug!("{:?} failed: {}", query, e);
        }
        if reply.send(result).is_err() {
            trace!("{:?} requester gave up", query);
        }
    }

    /// One request/reply exchange with `target`
    pub async fn exchange(&self, query: Query, payload: Vec<u8>, target: &Enode) -> Result<Vec<u8>> {
        let addr = target.udp_addr();
        let packet = KadPacket::new(MessageType::from(query), payload).encode()?;

        let unspecified: IpAddr = match addr {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await.map_err(|e| {
            warn!("Failed to open UDP socket: {}", e);
            P2pError::network_error_full("Failed to open UDP socket", addr.to_string(), e.to_string())
        })?;
        socket.send_to(&packet, addr).await.map_err(|e| {
            debug!("Failed to send to {}: {}", addr, e);
            P2pError::network_error_full("Failed to send", addr.to_string(), e.to_string())
        })?;

        let mut buffer = vec![0u8; MAX_PACKET_SIZE];
        let (len, from) = timeout(self.reply_timeout, socket.recv_from(&mut buffer))
            .await
            .map_err(|_| P2pError::timeout(format!("{:?} to {}", query, addr), "recv"))?
            .map_err(|e| P2pError::network_error_full("Failed to receive", addr.to_string(), e.to_string()))?;
        if from != addr {
            trace!("Reply for {} came from {}", addr, from);
        }

        let reply = KadPacket::decode(&buffer[..len])?;
        if reply.is_error() {
            return Err(P2pError::protocol_error_with_source("remote error", reply.text()).into());
        }
        Ok(reply.payload)
    }
}
