//! Multiplexed session
//!
//! A session owns one authenticated stream. A read loop and a write loop run
//! as separate tasks; replies are matched to waiting requests by frame id and
//! everything else lands on the read-in channel.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Instrument};

use crate::error::P2pError;
use crate::identity::IdGenerator;
use crate::protocol::frame::{Frame, FrameCodec, FrameReader, FrameWriter, NO_FLAGS, PING_FLAGS, PONG_FLAGS};
use crate::protocol::wire::{read_frame, write_frame};
use crate::transport::TransportConfig;

type PendingMap = Arc<RwLock<HashMap<u64, oneshot::Sender<Frame>>>>;

/// Authenticated duplex channel with request/reply correlation
pub struct Session {
    /// Remote endpoint, for logging
    peer: String,
    write_tx: mpsc::Sender<Frame>,
    read_rx: Mutex<mpsc::Receiver<Frame>>,
    pending: PendingMap,
    ids: Arc<dyn IdGenerator>,
    cancel: CancellationToken,
    config: TransportConfig,
}

impl Session {
    /// Start the read and write loops over `stream`
    pub fn spawn<S>(
        stream: S,
        codec: FrameCodec,
        peer: impl Into<String>,
        ids: Arc<dyn IdGenerator>,
        config: TransportConfig,
        parent: &CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let peer = peer.into();
        let (reader, writer) = codec.split();
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::channel(config.channel_capacity);
        let (read_tx, read_rx) = mpsc::channel(config.channel_capacity);
        let pending: PendingMap = Arc::new(RwLock::new(HashMap::new()));
        let cancel = parent.child_token();

        let span = info_span!("session", trace_id = %ids.generate(), peer = %peer);
        tokio::spawn(
            read_loop(reader, read_half, read_tx, write_tx.clone(), pending.clone(), cancel.clone())
                .instrument(span.clone()),
        );
        tokio::spawn(write_loop(writer, write_half, write_rx, cancel.clone()).instrument(span));

        Arc::new(Self {
            peer,
            write_tx,
            read_rx: Mutex::new(read_rx),
            pending,
            ids,
            cancel,
            config,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn enqueue(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                Err(P2pError::network_error_full("Session closed", self.peer.clone(), "cancelled").into())
            }
            sent = self.write_tx.send(frame) => {
                sent.map_err(|_| P2pError::network_error_full("Session closed", self.peer.clone(), "write loop gone"))?;
                Ok(())
            }
        }
    }

    /// Queue a fresh frame; returns its id
    pub async fn send(&self, data: Vec<u8>) -> Result<u64> {
        let id = self.ids.generate();
        self.enqueue(Frame::new(NO_FLAGS, id, data)).await?;
        Ok(id)
    }

    /// Answer a received frame under the same id
    pub async fn reply(&self, id: u64, data: Vec<u8>) -> Result<()> {
        self.enqueue(Frame::new(NO_FLAGS, id, data)).await
    }

    /// Next frame that did not answer one of our requests
    pub async fn receive(&self) -> Result<Frame> {
        let mut rx = self.read_rx.lock().await;
        rx.recv()
            .await
            .ok_or_else(|| P2pError::network_error_full("Session closed", self.peer.clone(), "read loop gone").into())
    }

    /// Send `data` and wait for the frame carrying the same id
    pub async fn request_reply(&self, data: Vec<u8>) -> Result<Frame> {
        self.request_with_flags(NO_FLAGS, data).await
    }

    async fn request_with_flags(&self, flags: [u8; 4], data: Vec<u8>) -> Result<Frame> {
        let id = self.ids.generate();
        let (tx, rx) = oneshot::channel();
        self.pending.write().await.insert(id, tx);

        if let Err(e) = self.enqueue(Frame::new(flags, id, data)).await {
            self.pending.write().await.remove(&id);
            return Err(e);
        }

        match timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(P2pError::network_error_full("Session closed", self.peer.clone(), "reply dropped").into()),
            Err(_) => {
                self.pending.write().await.remove(&id);
                warn!("Request {:016x} to {} timed out", id, self.peer);
                Err(P2pError::timeout(format!("no reply for frame {:016x}", id), "request_reply").into())
            }
        }
    }

    /// Heartbeat round trip
    pub async fn ping(&self) -> Result<()> {
        let frame = self.request_with_flags(PING_FLAGS, Vec::new()).await?;
        if !frame.is_pong() {
            return Err(P2pError::protocol_error_with_source("Expected PONG", format!("flags {:02x?}", frame.flags)).into());
        }
        Ok(())
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the session is closed
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn read_loop<S: AsyncRead>(
    mut codec: FrameReader,
    mut reader: ReadHalf<S>,
    read_tx: mpsc::Sender<Frame>,
    write_tx: mpsc::Sender<Frame>,
    pending: PendingMap,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_frame(&mut codec, &mut reader) => match result {
                Ok(frame) => frame,
                Err(e) => {
                    debug!("Read loop stopped: {}", e);
                    break;
                }
            }
        };

        if frame.is_ping() {
            trace!("PING {:016x}, answering PONG", frame.id);
            if write_tx.send(Frame::new(PONG_FLAGS, frame.id, Vec::new())).await.is_err() {
                break;
            }
            continue;
        }

        if let Some(waiter) = pending.write().await.remove(&frame.id) {
            let _ = waiter.send(frame);
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = read_tx.send(frame) => if sent.is_err() { break },
        }
    }

    cancel.cancel();
    // wake every waiter with a closed channel
    pending.write().await.clear();
}

async fn write_loop<S: AsyncWrite>(
    mut codec: FrameWriter,
    mut writer: WriteHalf<S>,
    mut write_rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            next = write_rx.recv() => match next {
                Some(frame) => frame,
                None => break,
            }
        };
        if let Err(e) = write_frame(&mut codec, &mut writer, frame.flags, frame.id, &frame.data).await {
            warn!("Write loop stopped: {}", e);
            break;
        }
    }
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::SequenceIdGenerator;
    use crate::protocol::frame::Secrets;
    use std::time::Duration;

    const KEY: &str = "6368616e676520746869732070617373776f726420746f206120736563726574";

    fn codec() -> FrameCodec {
        let key = hex::decode(KEY).unwrap();
        FrameCodec::new(Secrets::new(key.clone(), key, false)).unwrap()
    }

    fn pair(request_timeout: Duration) -> (Arc<Session>, Arc<Session>, CancellationToken) {
        let root = CancellationToken::new();
        let (a, b) = tokio::io::duplex(1 << 16);
        let config = TransportConfig {
            request_timeout,
            ..TransportConfig::default()
        };
        let left = Session::spawn(a, codec(), "left", Arc::new(SequenceIdGenerator::with_seed(0)), config.clone(), &root);
        let right = Session::spawn(b, codec(), "right", Arc::new(SequenceIdGenerator::with_seed(1000)), config, &root);
        (left, right, root)
    }

    #[tokio::test]
    async fn test_send_receive_in_order() {
        let (left, right, _root) = pair(Duration::from_secs(3));
        for i in 0..50u8 {
            left.send(vec![i; i as usize]).await.unwrap();
        }
        for i in 0..50u8 {
            let frame = right.receive().await.unwrap();
            assert_eq!(frame.data, vec![i; i as usize]);
        }
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (left, right, _root) = pair(Duration::from_secs(3));
        let responder = tokio::spawn(async move {
            let frame = right.receive().await.unwrap();
            let mut answer = frame.data.clone();
            answer.reverse();
            right.reply(frame.id, answer).await.unwrap();
            right
        });
        let reply = left.request_reply(b"abc".to_vec()).await.unwrap();
        assert_eq!(reply.data, b"cba");
        assert_eq!(left.pending_count().await, 0);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_timeout_deregisters() {
        let (left, _right, _root) = pair(Duration::from_millis(100));
        let err = left.request_reply(b"nobody answers".to_vec()).await.unwrap_err();
        let err = err.downcast_ref::<P2pError>().unwrap();
        assert!(matches!(err, P2pError::Timeout { .. }));
        assert_eq!(left.pending_count().await, 0);
    }

    #[tokio::test]
    async fn test_ping_is_answered_by_read_loop() {
        let (left, right, _root) = pair(Duration::from_secs(3));
        left.ping().await.unwrap();
        right.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_closes_both_ends() {
        let (left, right, root) = pair(Duration::from_secs(3));
        root.cancel();
        assert!(left.is_closed());
        assert!(right.is_closed());
        assert!(left.send(b"late".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_peer_close_ends_receive() {
        let (left, right, _root) = pair(Duration::from_secs(3));
        left.close();
        drop(left);
        tokio::time::timeout(Duration::from_secs(2), right.closed()).await.unwrap();
        assert!(right.receive().await.is_err());
    }
}
