//! RPC module
//!
//! KadRPC over UDP. The server turns datagrams into [`KadRequest`]s on the
//! DHT's inbound queue; the client dials the targets of requests the DHT
//! places on its outbound queue.

use tokio::sync::oneshot;

use crate::identity::Enode;
use crate::protocol::message::Query;

pub mod client;
pub mod server;

pub use client::KadClient;
pub use server::KadServer;

/// Answer to a [`KadRequest`]: reply payload, or a diagnostic sent back as `ERROR`
pub type KadReply = anyhow::Result<Vec<u8>>;

/// One query travelling between the UDP layer and the DHT
#[derive(Debug)]
pub struct KadRequest {
    pub query: Query,
    pub payload: Vec<u8>,
    /// Remote to dial; `None` for queries received from the network
    pub enode: Option<Enode>,
    pub reply: oneshot::Sender<KadReply>,
    pub trace_id: u64,
}

impl KadRequest {
    /// Query received from the network, to be answered by the DHT
    pub fn inbound(query: Query, payload: Vec<u8>, trace_id: u64) -> (Self, oneshot::Receiver<KadReply>) {
        Self::build(query, payload, None, trace_id)
    }

    /// Query the DHT wants sent to `enode`
    pub fn outbound(
        query: Query,
        payload: Vec<u8>,
        enode: Enode,
        trace_id: u64,
    ) -> (Self, oneshot::Receiver<KadReply>) {
        Self::build(query, payload, Some(enode), trace_id)
    }

    fn build(
        query: Query,
        payload: Vec<u8>,
        enode: Option<Enode>,
        trace_id: u64,
    ) -> (Self, oneshot::Receiver<KadReply>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                query,
                payload,
                enode,
                reply,
                trace_id,
            },
            rx,
        )
    }
}
