//! In-process transport
//!
//! `MemoryNetwork` connects any number of peers, a reference service and
//! clients living in the same process. Broadcasts are echoed to the
//! publisher's own subscriptions, like the proxy used by the TCP transport.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::transport::{Endpoint, InboundRequest, PeerTransport, Publication, TransportError};

const BUS_CAPACITY: usize = 4096;
const INBOX_CAPACITY: usize = 256;

/// Shared in-process network
pub struct MemoryNetwork {
    endpoints: DashMap<Endpoint, mpsc::Sender<InboundRequest>>,
    bus: broadcast::Sender<Publication>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Arc::new(Self {
            endpoints: DashMap::new(),
            bus,
        })
    }

    /// Create a transport handle attached to this network
    pub fn transport(self: &Arc<Self>) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
        })
    }

    /// Drop an endpoint as if its process died
    pub fn disconnect(&self, endpoint: &Endpoint) {
        if self.endpoints.remove(endpoint).is_some() {
            debug!("Disconnected in-memory endpoint {}", endpoint);
        }
    }

    pub fn is_bound(&self, endpoint: &Endpoint) -> bool {
        self.endpoints
            .get(endpoint)
            .is_some_and(|sender| !sender.is_closed())
    }
}

/// Transport handle for one process on a [`MemoryNetwork`]
pub struct MemoryTransport {
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn request(
        &self,
        target: &Endpoint,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let sender = self
            .network
            .endpoints
            .get(target)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(target.to_string()))?;

        let (request, reply) = InboundRequest::new(payload);
        sender
            .send(request)
            .await
            .map_err(|_| TransportError::Unreachable(target.to_string()))?;

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(bytes)) => Ok(bytes),
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => Err(TransportError::Timeout(target.to_string())),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        // No subscribers is not an error for a broadcast
        let _ = self.network.bus.send(Publication {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<mpsc::Receiver<Publication>, TransportError> {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let mut bus = self.network.bus.subscribe();
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);

        tokio::spawn(async move {
            loop {
                match bus.recv().await {
                    Ok(publication) => {
                        if !topics.contains(&publication.topic) {
                            continue;
                        }
                        if tx.send(publication).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("In-memory subscriber lagged, {} broadcasts dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    async fn bind(
        &self,
        endpoint: &Endpoint,
    ) -> Result<mpsc::Receiver<InboundRequest>, TransportError> {
        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        match self.network.endpoints.entry(endpoint.clone()) {
            Entry::Occupied(existing) if !existing.get().is_closed() => {
                return Err(TransportError::AddressInUse(endpoint.to_string()));
            }
            Entry::Occupied(mut stale) => {
                stale.insert(tx);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(tx);
            }
        }
        debug!("Bound in-memory endpoint {}", endpoint);
        Ok(rx)
    }
}
