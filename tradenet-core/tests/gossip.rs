/*
    gossip.rs - multi-node propagation over an in-memory network

    Nodes are full DataNodes wired to a LoopbackNetwork, so every envelope
    goes through the real codec, scheduler, outboxes and relay logic.
*/

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tradenet_core::config::Config;
use tradenet_core::core_node::{Collaborators, DataNode, NodeError};
use tradenet_core::core_router::PeerId;
use tradenet_core::core_store::model::payload::PersistablePayload;
use tradenet_core::core_store::store::StoreError;
use tradenet_core::test_utils::{
    eventually, offer_payload, seeded_signer, trade_statistics_at, LoopbackNetwork, NOW,
};

const PROPAGATION: Duration = Duration::from_secs(3);

struct Peer {
    node: DataNode,
    _dir: TempDir,
}

async fn spawn_peer(network: &Arc<LoopbackNetwork>, name: &str) -> Peer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.node.node_id = name.to_string();
    config.persistence.data_dir = dir.path().to_path_buf();
    config.statistics.republish_on_start = false;
    config.broadcast.min_delay = Duration::from_millis(1);
    config.broadcast.max_delay = Duration::from_millis(10);

    let node = DataNode::new(config, Collaborators::standard(network.transport(name)));
    network.register(name, node.router());
    node.start().await.unwrap();
    Peer { node, _dir: dir }
}

/// a - b - c, no direct link between a and c
async fn line_topology() -> (Arc<LoopbackNetwork>, Peer, Peer, Peer) {
    let network = LoopbackNetwork::new();
    let a = spawn_peer(&network, "a").await;
    let b = spawn_peer(&network, "b").await;
    let c = spawn_peer(&network, "c").await;
    network.connect("a", "b");
    network.connect("b", "c");
    (network, a, b, c)
}

async fn stop_all(peers: &[&Peer]) {
    for peer in peers {
        peer.node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_offer_reaches_indirect_peer() {
    let (_network, a, b, c) = line_topology().await;
    let owner = seeded_signer(1);

    let identity = a.node.add_local(offer_payload("offer-1"), &owner).unwrap();

    assert!(eventually(PROPAGATION, || c.node.store().contains(&identity)).await);
    assert!(b.node.store().contains(&identity));

    let relayed = c.node.store().get(&identity).unwrap();
    assert_eq!(relayed.sequence_number, 1);
    assert_eq!(relayed.owner_public_key, a.node.store().get(&identity).unwrap().owner_public_key);

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_removal_propagates_to_every_peer() {
    let (_network, a, b, c) = line_topology().await;
    let owner = seeded_signer(1);

    let identity = a.node.add_local(offer_payload("offer-1"), &owner).unwrap();
    assert!(eventually(PROPAGATION, || c.node.store().contains(&identity)).await);

    assert!(a.node.remove_local(&identity, &owner).unwrap());
    assert!(eventually(PROPAGATION, || {
        !b.node.store().contains(&identity) && !c.node.store().contains(&identity)
    })
    .await);

    // Removal is remembered: the stale add cannot come back
    let entry = c.node.tracker().current(&identity).unwrap();
    assert_eq!(entry.sequence_number, 2);

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_refresh_propagates_new_expiration() {
    let (_network, a, b, c) = line_topology().await;
    let owner = seeded_signer(1);

    let identity = a.node.add_local(offer_payload("offer-1"), &owner).unwrap();
    assert!(eventually(PROPAGATION, || c.node.store().contains(&identity)).await);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(a.node.refresh_local(&identity, &owner).unwrap());
    let refreshed = a.node.store().get(&identity).unwrap();

    assert!(eventually(PROPAGATION, || {
        c.node
            .store()
            .get(&identity)
            .is_some_and(|r| r.sequence_number == refreshed.sequence_number)
    })
    .await);
    assert_eq!(
        c.node.store().get(&identity).unwrap().expiration_timestamp,
        refreshed.expiration_timestamp
    );

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_trade_statistics_claim_held_network_wide() {
    let (_network, a, b, c) = line_topology().await;

    let original = trade_statistics_at("offer-123", "EUR", 30_000, NOW);
    let outcome = a
        .node
        .add_immutable_local(PersistablePayload::TradeStatistics(original))
        .await
        .unwrap();
    let first = outcome.identity();

    assert!(eventually(PROPAGATION, || c.node.ledger().contains(&first)).await);
    assert!(eventually(PROPAGATION, || c.node.aggregator().get("offer-123").is_some()).await);

    // Same offer ID, different content
    let competing = trade_statistics_at("offer-123", "EUR", 31_000, NOW);
    let result = b
        .node
        .add_immutable_local(PersistablePayload::TradeStatistics(competing))
        .await;
    assert!(matches!(
        result,
        Err(NodeError::Store(StoreError::DuplicateImmutableClaim { existing, .. })) if existing == first
    ));
    assert_eq!(b.node.ledger().len(), 1);

    stop_all(&[&a, &b, &c]).await;
}

#[tokio::test]
async fn test_late_joiner_receives_snapshot() {
    let network = LoopbackNetwork::new();
    let a = spawn_peer(&network, "a").await;
    let owner = seeded_signer(1);

    let offer = a.node.add_local(offer_payload("offer-1"), &owner).unwrap();
    a.node
        .add_immutable_local(PersistablePayload::TradeStatistics(trade_statistics_at(
            "offer-9", "USD", 29_000, NOW,
        )))
        .await
        .unwrap();

    let d = spawn_peer(&network, "d").await;
    network.connect("a", "d");
    // One envelope for the records, one for the ledger
    let envelopes = a.node.router().on_peer_connected(&PeerId::new("d")).await.unwrap();
    assert_eq!(envelopes, 2);

    assert!(eventually(PROPAGATION, || d.node.store().contains(&offer)).await);
    assert!(eventually(PROPAGATION, || d.node.ledger().len() == 1).await);

    stop_all(&[&a, &d]).await;
}

#[tokio::test]
async fn test_severed_peer_misses_updates() {
    let (network, a, b, c) = line_topology().await;
    network.sever("b", "c");
    let owner = seeded_signer(1);

    let identity = a.node.add_local(offer_payload("offer-1"), &owner).unwrap();
    assert!(eventually(PROPAGATION, || b.node.store().contains(&identity)).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!c.node.store().contains(&identity));

    stop_all(&[&a, &b, &c]).await;
}
