//! Two peers, the reference service and the proxy talking over real sockets

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tokio::net::TcpListener;

use parley_api::{Message, remote::model::STATUS_SUCCESS};
use parley_core::{
    Configuration, DomainStore, ElectionPhase, PeerNode,
    service::{Endpoint, PeerTransport},
};
use parley_server::{
    startup::{ShutdownSignal, run_proxy, run_reference},
    transport::tcp_transport,
};

async fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

struct Cluster {
    reference: String,
    publish: String,
    subscribe: String,
}

impl Cluster {
    async fn new() -> Self {
        Self {
            reference: free_address().await,
            publish: free_address().await,
            subscribe: free_address().await,
        }
    }

    fn configuration(&self, extra: &[(&str, String)]) -> Configuration {
        let mut builder = config::Config::builder()
            .set_override("parley.reference.address", self.reference.clone())
            .unwrap()
            .set_override("parley.proxy.publish-address", self.publish.clone())
            .unwrap()
            .set_override("parley.proxy.subscribe-address", self.subscribe.clone())
            .unwrap()
            .set_override("parley.rpc.peer-timeout-ms", 500)
            .unwrap()
            .set_override("parley.rpc.reference-timeout-ms", 500)
            .unwrap();
        for (key, value) in extra {
            builder = builder.set_override(*key, value.clone()).unwrap();
        }
        Configuration::from_config(builder.build().unwrap())
    }

    async fn peer(&self, name: &str) -> Arc<PeerNode> {
        let configuration = self.configuration(&[
            ("parley.peer.name", name.to_string()),
            ("parley.peer.id", free_address().await),
            ("parley.peer.domain-address", free_address().await),
        ]);
        PeerNode::new(
            &configuration,
            tcp_transport(&configuration),
            Arc::new(DomainStore::new()),
        )
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn test_login_replicates_over_tcp() {
    let cluster = Cluster::new().await;
    let shutdown = ShutdownSignal::new();

    let roles_config = cluster.configuration(&[]);
    let reference = tokio::spawn({
        let (config, shutdown) = (roles_config.clone(), shutdown.clone());
        async move { run_reference(&config, shutdown).await }
    });
    let proxy = tokio::spawn({
        let (config, shutdown) = (roles_config.clone(), shutdown.clone());
        async move { run_proxy(&config, shutdown).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let first = cluster.peer("first").await;
    let second = cluster.peer("second").await;
    assert_eq!(first.start().await.unwrap(), ElectionPhase::Coordinator);
    assert_eq!(second.start().await.unwrap(), ElectionPhase::Follower);
    // Subscriptions connect to the proxy in the background
    tokio::time::sleep(Duration::from_millis(300)).await;

    let client = tcp_transport(&roles_config);
    let request = Message::with_tag("login", &json!({"user": "ana"}), 0)
        .and_then(|m| m.encode())
        .unwrap();
    let reply = client
        .request(
            &Endpoint::Domain(second.domain_address().to_string()),
            request,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
    assert_eq!(Message::decode(&reply).unwrap().status(), Some(STATUS_SUCCESS));

    assert!(eventually(|| first.store().has_user("ana")).await);

    first.stop().await;
    second.stop().await;
    shutdown.shutdown();
    assert!(reference.await.unwrap().is_ok());
    assert!(proxy.await.unwrap().is_ok());
}
