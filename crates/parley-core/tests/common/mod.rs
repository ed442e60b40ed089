//! Common test utilities for multi-peer scenarios
//!
//! Every scenario runs on one in-process `MemoryNetwork` with a reference
//! service served by the real reference handlers.

#![allow(dead_code)]

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tokio::task::JoinHandle;

use parley_api::{Message, PeerIdentity};
use parley_core::{
    Configuration,
    handler::{reference_handlers, spawn_request_loop},
    service::{
        DomainStore, Endpoint, LogicalClock, MemoryNetwork, PeerNode, PeerTransport,
        ReferenceRegistry,
    },
};

/// RPC timeout used by test peers
pub const PEER_TIMEOUT_MS: i64 = 200;

pub struct TestReference {
    pub registry: Arc<ReferenceRegistry>,
    pub task: JoinHandle<()>,
}

/// Serve the reference service on `network`
pub async fn start_reference(network: &Arc<MemoryNetwork>) -> TestReference {
    let registry = Arc::new(ReferenceRegistry::default());
    let inbox = network
        .transport()
        .bind(&Endpoint::Reference)
        .await
        .expect("bind reference");
    let handlers = Arc::new(reference_handlers(
        registry.clone(),
        Arc::new(LogicalClock::new()),
    ));
    TestReference {
        registry,
        task: spawn_request_loop(handlers, inbox),
    }
}

pub fn domain_address(id: &str) -> String {
    format!("domain-{}", id)
}

/// Configuration of a test peer with short timeouts
pub fn peer_configuration(id: &str, overrides: &[(&str, &str)]) -> Configuration {
    let mut builder = config::Config::builder()
        .set_override("parley.peer.name", format!("peer-{}", id))
        .and_then(|b| b.set_override("parley.peer.id", id))
        .and_then(|b| b.set_override("parley.peer.domain-address", domain_address(id)))
        .and_then(|b| b.set_override("parley.rpc.peer-timeout-ms", PEER_TIMEOUT_MS))
        .and_then(|b| b.set_override("parley.rpc.reference-timeout-ms", PEER_TIMEOUT_MS))
        .expect("test configuration");
    for (key, value) in overrides {
        builder = builder.set_override(*key, *value).expect("override");
    }
    Configuration::from_config(builder.build().expect("build configuration"))
}

pub fn create_peer(network: &Arc<MemoryNetwork>, id: &str) -> Arc<PeerNode> {
    create_peer_with(network, id, &[], Arc::new(DomainStore::new()))
}

pub fn create_peer_with(
    network: &Arc<MemoryNetwork>,
    id: &str,
    overrides: &[(&str, &str)],
    store: Arc<DomainStore>,
) -> Arc<PeerNode> {
    PeerNode::new(&peer_configuration(id, overrides), network.transport(), store)
}

/// Create and start peers in order; ranks follow the order
pub async fn start_peers(network: &Arc<MemoryNetwork>, ids: &[&str]) -> Vec<Arc<PeerNode>> {
    let mut peers = Vec::new();
    for id in ids {
        let peer = create_peer(network, id);
        peer.start().await.expect("start peer");
        peers.push(peer);
    }
    peers
}

/// Stop a peer and drop its endpoints as if the process died
pub async fn kill_peer(network: &Arc<MemoryNetwork>, peer: &Arc<PeerNode>) {
    peer.stop().await;
    network.disconnect(&Endpoint::Peer(peer.identity().id.clone()));
    network.disconnect(&Endpoint::Domain(peer.domain_address().to_string()));
}

/// Send a client request to a peer's domain endpoint
pub async fn client_request(
    network: &Arc<MemoryNetwork>,
    peer: &Arc<PeerNode>,
    service: &str,
    data: Value,
) -> Message {
    let request = Message::with_tag(service, &data, 0)
        .and_then(|m| m.encode())
        .expect("encode request");
    let reply = network
        .transport()
        .request(
            &Endpoint::Domain(peer.domain_address().to_string()),
            request,
            Duration::from_secs(2),
        )
        .await
        .expect("client request");
    Message::decode(&reply).expect("decode reply")
}

/// Poll `condition` until it holds or three seconds pass
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Whether every peer agrees on `expected` as coordinator
pub fn all_follow(peers: &[Arc<PeerNode>], expected: &PeerIdentity) -> bool {
    peers
        .iter()
        .all(|peer| peer.election().coordinator().as_ref() == Some(expected))
}
