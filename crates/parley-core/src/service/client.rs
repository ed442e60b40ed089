// Typed RPC client over a PeerTransport
// Stamps every outgoing message with a fresh logical clock tick and merges
// the clock carried by every reply

use std::{sync::Arc, time::Duration};

use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use parley_api::{Message, ServiceTag};
use parley_common::ParleyError;

use super::{
    logical_clock::LogicalClock,
    transport::{Endpoint, PeerTransport, TransportError},
};

/// Failure of a single RPC
#[derive(thiserror::Error, Debug)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ParleyError),

    #[error("{service} rejected: {description}")]
    Rejected {
        service: String,
        description: String,
    },
}

impl RpcError {
    /// The target did not answer in time or could not be reached
    pub fn is_unreachable(&self) -> bool {
        matches!(self, RpcError::Transport(e) if e.is_transient())
    }
}

/// Shared client handle of one process
pub struct PeerClient {
    transport: Arc<dyn PeerTransport>,
    clock: Arc<LogicalClock>,
}

impl PeerClient {
    pub fn new(transport: Arc<dyn PeerTransport>, clock: Arc<LogicalClock>) -> Self {
        Self { transport, clock }
    }

    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        &self.transport
    }

    pub fn clock(&self) -> &Arc<LogicalClock> {
        &self.clock
    }

    /// Send a request and decode the reply's `data` as `R`
    pub async fn call<T, R>(
        &self,
        target: &Endpoint,
        service: ServiceTag,
        payload: &T,
        timeout: Duration,
    ) -> Result<R, RpcError>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let reply = self.call_raw(target, service, payload, timeout).await?;
        Ok(reply.data_as()?)
    }

    /// Send a request and return the reply envelope
    pub async fn call_raw<T: Serialize>(
        &self,
        target: &Endpoint,
        service: ServiceTag,
        payload: &T,
        timeout: Duration,
    ) -> Result<Message, RpcError> {
        let request = Message::new(service, payload, self.clock.tick())?;
        let bytes = self
            .transport
            .request(target, request.encode()?, timeout)
            .await?;

        let reply = Message::decode(&bytes)?;
        if let Some(remote) = reply.clock() {
            self.clock.observe(remote);
        }
        debug!("{} reply from {}: {:?}", service, target, reply.data);

        if reply.is_error() {
            return Err(RpcError::Rejected {
                service: reply.service.clone(),
                description: reply
                    .data
                    .get("description")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
            });
        }
        Ok(reply)
    }

    /// Fire-and-forget broadcast of a message on `topic`
    pub async fn publish(&self, topic: &str, message: &Message) -> Result<(), RpcError> {
        self.transport.publish(topic, message.encode()?).await?;
        Ok(())
    }
}
