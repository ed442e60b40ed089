//! Domain requests replicated across a group of peers

mod common;

use std::{sync::Arc, time::Duration};

use serde_json::json;

use common::*;
use parley_api::{
    Message,
    domain::{ChannelsResponse, UsersResponse},
    remote::model::{STATUS_OK, STATUS_SUCCESS},
};
use parley_common::TOPIC_REPLICATION;
use parley_core::{
    MemoryNetwork, PeerNode,
    service::{
        Endpoint, PeerTransport,
        persistence::{PersistenceConfig, load_snapshot, open_store},
        replication::ApplyOutcome,
    },
};

const IDS: [&str; 3] = ["s1:5561", "s2:5561", "s3:5561"];

fn users_everywhere(peers: &[Arc<PeerNode>], user: &str) -> bool {
    peers.iter().all(|peer| peer.store().has_user(user))
}

#[tokio::test]
async fn test_three_peer_end_to_end() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS).await;
    let coordinator = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &coordinator)).await);

    let reply = client_request(&network, &peers[1], "login", json!({"user": "ana"})).await;
    assert_eq!(reply.status(), Some(STATUS_SUCCESS));
    let reply = client_request(&network, &peers[2], "channel", json!({"channel": "geral"})).await;
    assert_eq!(reply.status(), Some(STATUS_SUCCESS));

    assert!(eventually(|| users_everywhere(&peers, "ana")).await);
    assert!(eventually(|| peers.iter().all(|p| p.store().has_channel("geral"))).await);

    // The channel was created on s3 but is visible through s1
    let reply = client_request(&network, &peers[0], "publish", json!({
        "user": "ana", "channel": "geral", "message": "oi"
    }))
    .await;
    assert_eq!(reply.status(), Some(STATUS_OK));

    assert!(eventually(|| peers.iter().all(|p| p.store().publications().len() == 1)).await);

    let reply = client_request(&network, &peers[2], "users", json!({})).await;
    let users: UsersResponse = reply.data_as().expect("users reply");
    assert_eq!(users.users, vec!["ana".to_string()]);

    let reply = client_request(&network, &peers[1], "listarCanal", json!({})).await;
    assert_eq!(reply.service, "channels");
    let channels: ChannelsResponse = reply.data_as().expect("channels reply");
    assert_eq!(channels.channels, vec!["geral".to_string()]);
}

#[tokio::test]
async fn test_replication_is_loop_free() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS).await;

    client_request(&network, &peers[0], "login", json!({"user": "ana"})).await;
    client_request(&network, &peers[0], "login", json!({"user": "bia"})).await;
    assert!(eventually(|| users_everywhere(&peers, "bia")).await);

    // Let any echo settle before counting
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(peers[0].replicator().propagated_count(), 2);
    assert_eq!(peers[1].replicator().propagated_count(), 0);
    assert_eq!(peers[2].replicator().propagated_count(), 0);
    assert_eq!(peers[0].replicator().applied_count(), 0);
    assert_eq!(peers[1].replicator().applied_count(), 2);
    assert_eq!(peers[2].replicator().applied_count(), 2);
}

#[tokio::test]
async fn test_redelivered_operation_is_applied_once() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS[..2]).await;

    let mut tap = network
        .transport()
        .subscribe(&[TOPIC_REPLICATION])
        .await
        .expect("subscribe");

    client_request(&network, &peers[0], "channel", json!({"channel": "geral"})).await;
    let broadcast = tokio::time::timeout(Duration::from_secs(1), tap.recv())
        .await
        .expect("replication broadcast")
        .expect("open subscription");

    assert!(eventually(|| peers[1].store().has_channel("geral")).await);
    let before = peers[1].store().snapshot();

    assert_eq!(
        peers[1].replicator().handle_publication(&broadcast.payload).await,
        ApplyOutcome::Duplicate
    );
    assert_eq!(
        peers[0].replicator().handle_publication(&broadcast.payload).await,
        ApplyOutcome::SelfOrigin
    );
    assert_eq!(peers[1].store().snapshot(), before);
}

#[tokio::test]
async fn test_failed_request_is_not_replicated() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS[..2]).await;

    client_request(&network, &peers[0], "login", json!({"user": "ana"})).await;
    let reply = client_request(&network, &peers[1], "login", json!({"user": "ana"})).await;
    // s2 may not have applied the broadcast yet; either way no second broadcast
    if reply.is_error() {
        assert_eq!(peers[1].replicator().propagated_count(), 0);
    }

    let reply = client_request(&network, &peers[0], "message", json!({
        "src": "ana", "dst": "nobody", "message": "oi"
    }))
    .await;
    assert!(reply.is_error());
    assert_eq!(peers[0].replicator().propagated_count(), 1);
}

#[tokio::test]
async fn test_malformed_requests_get_error_replies() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS[..1]).await;
    let endpoint = Endpoint::Domain(peers[0].domain_address().to_string());

    let reply = network
        .transport()
        .request(&endpoint, b"\xffgarbage".to_vec(), Duration::from_secs(1))
        .await
        .expect("reply");
    let reply = Message::decode(&reply).expect("error reply is a message");
    assert_eq!(reply.service, "unknown");
    assert!(reply.is_error());

    let reply = client_request(&network, &peers[0], "teleport", json!({})).await;
    assert!(reply.is_error());

    // Garbage on the broadcast topics does not stop the peer
    network
        .transport()
        .publish(TOPIC_REPLICATION, b"garbage".to_vec())
        .await
        .expect("publish");
    let reply = client_request(&network, &peers[0], "login", json!({"user": "ana"})).await;
    assert_eq!(reply.status(), Some(STATUS_SUCCESS));
}

#[tokio::test]
async fn test_restarted_origin_keeps_replicating() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS[..2]).await;

    for n in 0..9 {
        let user = format!("old{}", n);
        client_request(&network, &peers[0], "login", json!({"user": user})).await;
    }
    assert!(eventually(|| peers[1].store().users().len() == 9).await);

    // Same id, fresh logical clock and incarnation
    kill_peer(&network, &peers[0]).await;
    let restarted = create_peer(&network, IDS[0]);
    restarted.start().await.expect("restart peer");
    assert_ne!(
        restarted.replicator().incarnation(),
        peers[0].replicator().incarnation()
    );

    client_request(&network, &restarted, "users", json!({})).await;
    for n in 0..10 {
        let user = format!("new{}", n);
        let reply = client_request(&network, &restarted, "login", json!({"user": user})).await;
        assert_eq!(reply.status(), Some(STATUS_SUCCESS));
    }

    assert_eq!(restarted.replicator().propagated_count(), 10);
    assert!(eventually(|| peers[1].store().users().len() == 19).await);
    for n in 0..10 {
        assert!(peers[1].store().has_user(&format!("new{}", n)));
    }
}

#[tokio::test]
async fn test_store_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PersistenceConfig {
        data_dir: dir.path().to_path_buf(),
        batch_window: Duration::from_millis(10),
    };

    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let (store, writer) = open_store(config.clone()).await;
    let peer = create_peer_with(&network, IDS[0], &[], store);
    peer.start().await.expect("start peer");

    client_request(&network, &peer, "login", json!({"user": "ana"})).await;
    client_request(&network, &peer, "channel", json!({"channel": "geral"})).await;

    let mut persisted = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let snapshot = load_snapshot(dir.path()).await;
        if snapshot.users.len() == 1 && snapshot.channels.len() == 1 {
            persisted = true;
            break;
        }
    }
    assert!(persisted);
    kill_peer(&network, &peer).await;
    writer.abort();

    let (restored, writer) = open_store(config).await;
    assert!(restored.has_user("ana"));
    assert!(restored.has_channel("geral"));
    writer.abort();
}
