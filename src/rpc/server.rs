//! KadRPC UDP server
//!
//! Every datagram is one query. Well-formed queries are pushed to the DHT's
//! inbound queue and answered with the DHT's reply; anything else, or a
//! reply that does not arrive in time, is answered with an `ERROR`
//! envelope carrying a readable diagnostic.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::error::P2pError;
use crate::identity::IdGenerator;
use crate::protocol::message::{KadPacket, MessageType, Query};
use crate::queue::EventQueue;
use crate::rpc::KadRequest;

/// Default wait for the DHT to answer
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(3);
/// Pause after a failed receive
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);
/// Receive buffer; larger than any valid packet so oversize datagrams are detected
const RECV_BUFFER_SIZE: usize = 1 << 16;

/// UDP front end of the DHT
pub struct KadServer {
    socket: Arc<UdpSocket>,
    inbound: Arc<EventQueue<KadRequest>>,
    ids: Arc<dyn IdGenerator>,
    reply_timeout: Duration,
}

impl KadServer {
    pub async fn bind(
        addr: SocketAddr,
        inbound: Arc<EventQueue<KadRequest>>,
        ids: Arc<dyn IdGenerator>,
        reply_timeout: Duration,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await.map_err(|e| {
            error!("Failed to bind UDP socket to {}: {}", addr, e);
            P2pError::lifecycle_error_with_source(format!("Failed to listen on udp {}", addr), e.to_string())
        })?;
        Ok(Self {
            socket: Arc::new(socket),
            inbound,
            ids,
            reply_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Receive loop; runs until `cancel` fires
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let local = self.local_addr()?;
        info!("KadRPC listening on udp {}", local);
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("KadRPC server on {} stopping", local);
                    break;
                }
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, from)) => {
                        let data = buffer[..len].to_vec();
                        let server = self.clone();
                        let span = info_span!("kad", trace_id = %self.ids.generate(), from = %from);
                        tokio::spawn(async move { server.handle_packet(data, from).await }.instrument(span));
                    }
                    Err(e) => {
                        warn!("UDP receive on {} failed: {}", local, e);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = sleep(RECV_RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_packet(&self, data: Vec<u8>, from: SocketAddr) {
        trace!("Received {} bytes", data.len());
        let reply = self.answer(&data).await;
        let bytes = match reply.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Reply to {} not encodable: {}", from, e);
                match KadPacket::error("reply too large").encode() {
                    Ok(bytes) => bytes,
                    Err(_) => return,
                }
            }
        };
        if let Err(e) = self.socket.send_to(&bytes, from).await {
            debug!("Failed to answer {}: {}", from, e);
        }
    }

    /// Reply envelope for one raw datagram
    pub async fn answer(&self, data: &[u8]) -> KadPacket {
        let packet = match KadPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Malformed packet: {}", e);
                return KadPacket::error(e.to_string());
            }
        };
        let query = match Query::try_from(packet.kind) {
            Ok(query) => query,
            Err(e) => return KadPacket::error(e.to_string()),
        };

        let (request, reply) = KadRequest::inbound(query, packet.payload, self.ids.generate());
        if !self.inbound.push(request).await {
            return KadPacket::error("server busy");
        }

        match timeout(self.reply_timeout, reply).await {
            Ok(Ok(Ok(payload))) => KadPacket::new(MessageType::from(query), payload),
            Ok(Ok(Err(e))) => KadPacket::error(e.to_string()),
            Ok(Err(_)) => KadPacket::error("request dropped"),
            Err(_) => {
                warn!("{:?} not answered within {:?}", query, self.reply_timeout);
                KadPacket::error("data handle timeout")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SequenceIdGenerator;
    use crate::queue::QueueConfig;

    async fn server(reply_timeout: Duration) -> (Arc<KadServer>, Arc<EventQueue<KadRequest>>) {
        let inbound = Arc::new(EventQueue::new("dht", QueueConfig::default()));
        let server = KadServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            inbound.clone(),
            Arc::new(SequenceIdGenerator::with_seed(0)),
            reply_timeout,
        )
        .await
        .unwrap();
        (Arc::new(server), inbound)
    }

    #[tokio::test]
    async fn test_unknown_type_gets_error() {
        let (server, inbound) = server(REPLY_TIMEOUT).await;
        let reply = server.answer(&[0x99, 0x00, 0x00]).await;
        assert!(reply.is_error());
        assert!(!reply.text().is_empty());
        assert_eq!(inbound.stats().len, 0);
    }

    #[tokio::test]
    async fn test_short_and_truncated_packets() {
        let (server, _inbound) = server(REPLY_TIMEOUT).await;
        assert!(server.answer(&[]).await.is_error());
        assert!(server.answer(&[0x02, 0x00, 0x05, b'a']).await.is_error());
        assert!(server.answer(&[0xFF, 0x00, 0x00]).await.is_error());
    }

    #[tokio::test]
    async fn test_reply_timeout() {
        let (server, inbound) = server(Duration::from_millis(20)).await;
        let reply = server.answer(&[0x02, 0x00, 0x00]).await;
        assert!(reply.is_error());
        assert_eq!(reply.text(), "data handle timeout");
        assert_eq!(inbound.stats().len, 1);
    }

    #[tokio::test]
    async fn test_round_trip_over_udp() {
        let (server, inbound) = server(REPLY_TIMEOUT).await;
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(server.clone().serve(cancel.clone()));

        tokio::spawn(async move {
            let request = inbound.pull().await.unwrap();
            assert_eq!(request.query, Query::FindValue);
            let mut answer = request.payload.clone();
            answer.reverse();
            request.reply.send(Ok(answer)).unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let query = KadPacket::new(MessageType::FindValue, b"abc".to_vec()).encode().unwrap();
        socket.send_to(&query, addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, _) = timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await.unwrap().unwrap();
        let reply = KadPacket::decode(&buf[..n]).unwrap();
        assert_eq!(reply, KadPacket::new(MessageType::FindValue, b"cba".to_vec()));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
