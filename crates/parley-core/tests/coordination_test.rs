//! Election and clock synchronization across several peers

mod common;

use std::sync::Arc;

use serde_json::json;

use common::*;
use parley_core::{
    ElectionPhase, MemoryNetwork,
    service::{DomainStore, Endpoint, PeerTransport, clock_sync::SyncOutcome},
};

const IDS: [&str; 3] = ["p1:5561", "p2:5561", "p3:5561"];

#[tokio::test]
async fn test_lowest_rank_becomes_coordinator() {
    let network = MemoryNetwork::new();
    let reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS).await;

    let expected = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &expected)).await);
    assert_eq!(peers[0].election().phase(), ElectionPhase::Coordinator);
    assert_eq!(peers[1].election().phase(), ElectionPhase::Follower);
    assert_eq!(peers[2].election().phase(), ElectionPhase::Follower);

    let ranks: Vec<i64> = reference.registry.list().iter().map(|p| p.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_boot_agrees_on_rank_one() {
    let network = MemoryNetwork::new();
    let reference = start_reference(&network).await;
    let peers: Vec<_> = IDS.iter().map(|id| create_peer(&network, id)).collect();

    let starts = peers.iter().map(|peer| {
        let peer = peer.clone();
        tokio::spawn(async move { peer.start().await })
    });
    for started in futures::future::join_all(starts).await {
        assert!(started.unwrap().is_ok());
    }

    let ranked = reference.registry.list();
    assert_eq!(ranked.len(), 3);
    let first = ranked
        .iter()
        .find(|p| p.rank == 1)
        .map(|p| p.id.clone())
        .unwrap();
    let expected = peers
        .iter()
        .find(|peer| peer.identity().id == first)
        .map(|peer| peer.identity().clone())
        .unwrap();

    assert!(eventually(|| all_follow(&peers, &expected)).await);
    for peer in &peers {
        let phase = peer.election().phase();
        if peer.identity() == &expected {
            assert_eq!(phase, ElectionPhase::Coordinator);
        } else {
            assert_eq!(phase, ElectionPhase::Follower);
        }
    }
}

#[tokio::test]
async fn test_coordinator_failure_is_detected_by_clock_sync() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS).await;
    let first = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &first)).await);

    kill_peer(&network, &peers[0]).await;

    let outcome = peers[1].clock_sync().trigger().await;
    assert_eq!(
        outcome,
        SyncOutcome::ElectionTriggered(ElectionPhase::Coordinator)
    );

    let survivors = &peers[1..];
    let second = peers[1].identity().clone();
    assert!(eventually(|| all_follow(survivors, &second)).await);
}

#[tokio::test]
async fn test_every_nth_request_checks_the_coordinator() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;

    let mut peers = Vec::new();
    for id in IDS {
        let peer = create_peer_with(
            &network,
            id,
            &[("parley.clock-sync.every-requests", "2")],
            Arc::new(DomainStore::new()),
        );
        peer.start().await.expect("start peer");
        peers.push(peer);
    }
    let first = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &first)).await);

    kill_peer(&network, &peers[0]).await;

    // The second request is due for sync, which finds the coordinator gone
    client_request(&network, &peers[2], "users", json!({})).await;
    client_request(&network, &peers[2], "users", json!({})).await;

    let second = peers[1].identity().clone();
    assert!(eventually(|| all_follow(&peers[1..], &second)).await);
    assert!(peers[1].election().is_coordinator());
}

#[tokio::test]
async fn test_berkeley_round_converges_offsets() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS).await;
    let first = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &first)).await);

    peers[1].clock_sync().apply_adjustment(120);
    peers[2].clock_sync().apply_adjustment(-60);

    let plan = peers[0]
        .clock_sync()
        .run_round()
        .await
        .expect("no round running");
    assert_eq!(plan.adjustments.len(), 2);

    let offsets: Vec<i64> = peers.iter().map(|p| p.clock_sync().offset_ms()).collect();
    let min = offsets.iter().min().copied().unwrap_or_default();
    let max = offsets.iter().max().copied().unwrap_or_default();
    assert!(max - min <= 5, "offsets did not converge: {:?}", offsets);
    // Average of 0, 120 and -60
    assert!((offsets[0] - 20).abs() <= 5, "coordinator offset {:?}", offsets);
}

#[tokio::test]
async fn test_follower_trigger_reaches_coordinator() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS[..2]).await;
    let first = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &first)).await);

    assert_eq!(
        peers[1].clock_sync().trigger().await,
        SyncOutcome::CoordinatorReachable
    );
}

#[tokio::test]
async fn test_busy_coordination_endpoint_makes_peer_passive() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;

    // Someone else already owns the coordination endpoint
    let _squatter = network
        .transport()
        .bind(&Endpoint::Peer(IDS[0].to_string()))
        .await
        .expect("bind");

    let passive = create_peer(&network, IDS[0]);
    let phase = passive.start().await.expect("start passive peer");
    assert!(passive.election().is_passive());
    assert_eq!(phase, ElectionPhase::Idle);
    assert_eq!(passive.clock_sync().trigger().await, SyncOutcome::Skipped);

    // A passive peer still serves clients and follows announcements
    let reply = client_request(&network, &passive, "login", json!({"user": "ana"})).await;
    assert!(!reply.is_error());

    let active = create_peer(&network, IDS[1]);
    active.start().await.expect("start active peer");
    let active_id = active.identity().clone();
    assert!(eventually(|| passive.election().coordinator().as_ref() == Some(&active_id)).await);
}

#[tokio::test]
async fn test_malformed_announcements_are_dropped() {
    let network = MemoryNetwork::new();
    let _reference = start_reference(&network).await;
    let peers = start_peers(&network, &IDS[..2]).await;
    let first = peers[0].identity().clone();
    assert!(eventually(|| all_follow(&peers, &first)).await);

    assert!(!peers[1].handle_announcement(b"not json").await);
    assert!(
        !peers[1]
            .handle_announcement(br#"{"service":"election","data":{"clock":1}}"#)
            .await
    );
    assert_eq!(peers[1].election().coordinator(), Some(first));
}
