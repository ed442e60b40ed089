//! TCP implementation of the peer transport
//!
//! Requests open a connection to the target address, write one frame and
//! read one reply frame. Bound endpoints accept any number of requests per
//! connection. Broadcasts go through the proxy: publishers write to its
//! publish address, subscribers read everything from its subscribe address
//! and keep the topics they asked for.
//!
//! Publishing only queues the publication; a writer task owns the proxy
//! connection, so a proxy that stops reading never stalls the caller.

use std::{
    io::ErrorKind,
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use parley_core::{
    model::Configuration,
    service::transport::{Endpoint, InboundRequest, PeerTransport, Publication, TransportError},
};

use super::codec::{read_frame, read_publication, write_frame, write_publication};

const INBOX_CAPACITY: usize = 256;
const SUBSCRIPTION_CAPACITY: usize = 1024;
const PUBLISH_QUEUE_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct TcpTransportConfig {
    pub reference_address: String,
    pub proxy_publish_address: String,
    pub proxy_subscribe_address: String,
    /// Delay before a dropped subscription reconnects to the proxy
    pub reconnect_delay: Duration,
    /// Bound on one connect or write to the proxy publish address
    pub publish_timeout: Duration,
}

impl TcpTransportConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            reference_address: config.reference_address(),
            proxy_publish_address: config.proxy_publish_address(),
            proxy_subscribe_address: config.proxy_subscribe_address(),
            reconnect_delay: Duration::from_millis(500),
            publish_timeout: Duration::from_millis(config.proxy_publish_timeout_ms()),
        }
    }
}

pub struct TcpTransport {
    config: TcpTransportConfig,
    publisher: OnceLock<mpsc::Sender<Publication>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        Self {
            config,
            publisher: OnceLock::new(),
        }
    }

    fn address(&self, endpoint: &Endpoint) -> String {
        match endpoint {
            Endpoint::Reference => self.config.reference_address.clone(),
            Endpoint::Peer(address) | Endpoint::Domain(address) => address.clone(),
        }
    }

    async fn exchange(address: &str, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut stream = TcpStream::connect(address).await.map_err(|e| match e.kind() {
            ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                TransportError::Unreachable(address.to_string())
            }
            _ => TransportError::Io(e),
        })?;
        write_frame(&mut stream, payload).await?;
        read_frame(&mut stream).await?.ok_or(TransportError::Closed)
    }

    /// Queue of the writer task, started on first use
    fn publisher(&self) -> &mpsc::Sender<Publication> {
        self.publisher.get_or_init(|| {
            let (tx, rx) = mpsc::channel(PUBLISH_QUEUE_CAPACITY);
            tokio::spawn(run_publisher(
                self.config.proxy_publish_address.clone(),
                self.config.publish_timeout,
                rx,
            ));
            tx
        })
    }
}

#[async_trait]
impl PeerTransport for TcpTransport {
    async fn request(
        &self,
        target: &Endpoint,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        let address = self.address(target);
        tokio::time::timeout(timeout, Self::exchange(&address, &payload))
            .await
            .map_err(|_| TransportError::Timeout(address.clone()))?
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let publication = Publication {
            topic: topic.to_string(),
            payload,
        };
        self.publisher()
            .try_send(publication)
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => {
                    TransportError::Backlogged(self.config.proxy_publish_address.clone())
                }
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    async fn subscribe(
        &self,
        topics: &[&str],
    ) -> Result<mpsc::Receiver<Publication>, TransportError> {
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let address = self.config.proxy_subscribe_address.clone();
        let reconnect_delay = self.config.reconnect_delay;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        tokio::spawn(async move {
            while !tx.is_closed() {
                let mut stream = match TcpStream::connect(&address).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Cannot subscribe at proxy {}: {}", address, e);
                        tokio::time::sleep(reconnect_delay).await;
                        continue;
                    }
                };
                info!("Subscribed to {:?} at proxy {}", topics, address);

                loop {
                    match read_publication(&mut stream).await {
                        Ok(Some(publication)) => {
                            if !topics.contains(&publication.topic) {
                                continue;
                            }
                            if tx.send(publication).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            warn!("Proxy {} closed the subscription", address);
                            break;
                        }
                        Err(e) => {
                            warn!("Subscription to proxy {} failed: {}", address, e);
                            break;
                        }
                    }
                }
                tokio::time::sleep(reconnect_delay).await;
            }
        });

        Ok(rx)
    }

    async fn bind(
        &self,
        endpoint: &Endpoint,
    ) -> Result<mpsc::Receiver<InboundRequest>, TransportError> {
        let address = self.address(endpoint);
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            if e.kind() == ErrorKind::AddrInUse {
                TransportError::AddressInUse(address.clone())
            } else {
                TransportError::Io(e)
            }
        })?;
        info!("Listening for {} on {}", endpoint, address);

        let (tx, rx) = mpsc::channel(INBOX_CAPACITY);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = tx.closed() => break,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        debug!("Accepted connection from {}", remote);
                        tokio::spawn(serve_connection(stream, tx.clone()));
                    }
                    Err(e) => warn!("Accept on {} failed: {}", address, e),
                }
            }
            debug!("Listener on {} closed", address);
        });

        Ok(rx)
    }
}

/// Drain queued publications into the proxy, one connection at a time
///
/// A failed write drops the connection and the publication is retried once
/// on a fresh one. A write that times out is not retried.
async fn run_publisher(
    address: String,
    timeout: Duration,
    mut queue: mpsc::Receiver<Publication>,
) {
    let mut connection: Option<TcpStream> = None;
    while let Some(publication) = queue.recv().await {
        for attempt in 0..2 {
            match send_publication(&address, timeout, &mut connection, &publication).await {
                Ok(()) => break,
                Err(TransportError::Timeout(_)) => {
                    warn!(
                        "Proxy {} stopped reading, dropped publication on {}",
                        address, publication.topic
                    );
                    break;
                }
                Err(e) if attempt == 0 && !matches!(e, TransportError::Unreachable(_)) => {
                    debug!("Publish failed ({}), reconnecting to proxy", e);
                }
                Err(e) => {
                    warn!("Dropped publication on {}: {}", publication.topic, e);
                    break;
                }
            }
        }
    }
    debug!("Publisher for {} closed", address);
}

async fn send_publication(
    address: &str,
    timeout: Duration,
    connection: &mut Option<TcpStream>,
    publication: &Publication,
) -> Result<(), TransportError> {
    if connection.is_none() {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout(address.to_string()))?
            .map_err(|_| TransportError::Unreachable(address.to_string()))?;
        debug!("Connected to proxy at {}", address);
        *connection = Some(stream);
    }
    let Some(stream) = connection.as_mut() else {
        return Err(TransportError::Closed);
    };

    let result = match tokio::time::timeout(timeout, write_publication(stream, publication)).await
    {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(address.to_string())),
    };
    if result.is_err() {
        *connection = None;
    }
    result
}

/// Hand every request frame of one connection to the endpoint's inbox
async fn serve_connection(mut stream: TcpStream, inbox: mpsc::Sender<InboundRequest>) {
    loop {
        let payload = match read_frame(&mut stream).await {
            Ok(Some(payload)) => payload,
            Ok(None) => break,
            Err(e) => {
                debug!("Dropping connection: {}", e);
                break;
            }
        };

        let (request, reply) = InboundRequest::new(payload);
        if inbox.send(request).await.is_err() {
            break;
        }
        let Ok(reply) = reply.await else {
            break;
        };
        if let Err(e) = write_frame(&mut stream, &reply).await {
            debug!("Failed to write reply: {}", e);
            break;
        }
    }
}

/// Shared handle used by every component of one process
pub fn tcp_transport(config: &Configuration) -> Arc<TcpTransport> {
    Arc::new(TcpTransport::new(TcpTransportConfig::from_configuration(config)))
}
