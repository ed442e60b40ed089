//! Transport boundary
//!
//! The coordination layer talks to the world through three primitives:
//! request/reply to one endpoint, broadcast publish, and broadcast
//! subscribe. Payloads are opaque bytes here; encoding and clock handling
//! happen in [`super::client::PeerClient`] and the handler registry so that
//! malformed payloads can be answered instead of dropped by the transport.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// An addressable request/reply endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// The rank/heartbeat/list reference service
    Reference,
    /// A peer's coordination endpoint (election, clock, clockAdjust), keyed by peer id
    Peer(String),
    /// A peer's client-facing domain endpoint
    Domain(String),
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Reference => write!(f, "reference"),
            Endpoint::Peer(id) => write!(f, "peer:{}", id),
            Endpoint::Domain(address) => write!(f, "domain:{}", address),
        }
    }
}

/// A request received on a bound endpoint
#[derive(Debug)]
pub struct InboundRequest {
    pub payload: Vec<u8>,
    pub reply: oneshot::Sender<Vec<u8>>,
}

impl InboundRequest {
    pub fn new(payload: Vec<u8>) -> (Self, oneshot::Receiver<Vec<u8>>) {
        let (reply, rx) = oneshot::channel();
        (Self { payload, reply }, rx)
    }

    /// Send the reply; a requester that already gave up is ignored
    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.reply.send(payload);
    }
}

/// A broadcast delivered to a subscriber
#[derive(Clone, Debug, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Transport failures
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("endpoint {0} is unreachable")]
    Unreachable(String),

    #[error("endpoint {0} is already bound")]
    AddressInUse(String),

    #[error("connection closed")]
    Closed,

    #[error("publish queue to {0} is full")]
    Backlogged(String),

    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Failures that mean "the other side is not there right now"
    pub fn is_transient(&self) -> bool {
        !matches!(self, TransportError::AddressInUse(_))
    }
}

/// Request/reply plus publish/subscribe
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send one request and wait for its reply, bounded by `timeout`
    async fn request(
        &self,
        target: &Endpoint,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Fire-and-forget broadcast
    ///
    /// Must not wait on a slow broadcast hub; implementations may queue the
    /// publication and fail with [`TransportError::Backlogged`] instead.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Receive every broadcast on the given topics from now on
    async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<mpsc::Receiver<Publication>, TransportError>;

    /// Bind a request/reply endpoint for this process
    ///
    /// Fails with [`TransportError::AddressInUse`] when another live process
    /// already owns the endpoint.
    async fn bind(
        &self,
        endpoint: &Endpoint,
    ) -> Result<mpsc::Receiver<InboundRequest>, TransportError>;
}
