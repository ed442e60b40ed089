//! Broadcast proxy
//!
//! Publishers connect to the publish address and write topic/payload frame
//! pairs; every connection on the subscribe address receives every
//! publication. Topic filtering happens at the subscriber.

use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tracing::{debug, info, warn};

use parley_core::{model::Configuration, service::transport::Publication};

use super::codec::{read_publication, write_publication};

#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub publish_address: String,
    pub subscribe_address: String,
    /// Publications buffered per slow subscriber before it starts losing them
    pub capacity: usize,
}

impl ProxyConfig {
    pub fn from_configuration(config: &Configuration) -> Self {
        Self {
            publish_address: config.proxy_publish_address(),
            subscribe_address: config.proxy_subscribe_address(),
            capacity: 4096,
        }
    }
}

pub struct BroadcastProxy {
    publishers: TcpListener,
    subscribers: TcpListener,
    bus: broadcast::Sender<Publication>,
}

impl BroadcastProxy {
    pub async fn bind(config: &ProxyConfig) -> anyhow::Result<Self> {
        let publishers = TcpListener::bind(&config.publish_address).await?;
        let subscribers = TcpListener::bind(&config.subscribe_address).await?;
        let (bus, _) = broadcast::channel(config.capacity.max(1));
        info!(
            "Broadcast proxy listening: publish {}, subscribe {}",
            config.publish_address, config.subscribe_address
        );
        Ok(Self {
            publishers,
            subscribers,
            bus,
        })
    }

    pub fn publish_address(&self) -> std::io::Result<std::net::SocketAddr> {
        self.publishers.local_addr()
    }

    pub fn subscribe_address(&self) -> std::io::Result<std::net::SocketAddr> {
        self.subscribers.local_addr()
    }

    /// Accept publishers and subscribers until the task is cancelled
    pub async fn run(self) {
        loop {
            tokio::select! {
                accepted = self.publishers.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Publisher connected from {}", remote);
                        tokio::spawn(forward_publisher(stream, self.bus.clone()));
                    }
                    Err(e) => warn!("Accepting publisher failed: {}", e),
                },
                accepted = self.subscribers.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!("Subscriber connected from {}", remote);
                        tokio::spawn(feed_subscriber(stream, self.bus.subscribe()));
                    }
                    Err(e) => warn!("Accepting subscriber failed: {}", e),
                },
            }
        }
    }
}

async fn forward_publisher(mut stream: TcpStream, bus: broadcast::Sender<Publication>) {
    loop {
        match read_publication(&mut stream).await {
            Ok(Some(publication)) => {
                // No subscribers yet is fine
                let _ = bus.send(publication);
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Dropping publisher connection: {}", e);
                break;
            }
        }
    }
    debug!("Publisher disconnected");
}

async fn feed_subscriber(mut stream: TcpStream, mut bus: broadcast::Receiver<Publication>) {
    loop {
        match bus.recv().await {
            Ok(publication) => {
                if let Err(e) = write_publication(&mut stream, &publication).await {
                    debug!("Subscriber gone: {}", e);
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Subscriber lagged, {} publications dropped", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parley_core::service::transport::PeerTransport;

    use super::*;
    use crate::transport::tcp::{TcpTransport, TcpTransportConfig};

    #[tokio::test]
    async fn test_publications_reach_matching_subscribers() {
        let proxy = BroadcastProxy::bind(&ProxyConfig {
            publish_address: "127.0.0.1:0".to_string(),
            subscribe_address: "127.0.0.1:0".to_string(),
            capacity: 16,
        })
        .await
        .unwrap();
        let config = TcpTransportConfig {
            reference_address: "127.0.0.1:1".to_string(),
            proxy_publish_address: proxy.publish_address().unwrap().to_string(),
            proxy_subscribe_address: proxy.subscribe_address().unwrap().to_string(),
            reconnect_delay: Duration::from_millis(10),
            publish_timeout: Duration::from_secs(1),
        };
        let proxy_task = tokio::spawn(proxy.run());

        let transport = TcpTransport::new(config);
        let mut servers = transport.subscribe(&["servers"]).await.unwrap();
        // Wait for the subscription to be registered at the proxy
        tokio::time::sleep(Duration::from_millis(100)).await;

        transport
            .publish("replication", b"ignored".to_vec())
            .await
            .unwrap();
        transport.publish("servers", b"hello".to_vec()).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(2), servers.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.topic, "servers");
        assert_eq!(received.payload, b"hello");
        proxy_task.abort();
    }
}
