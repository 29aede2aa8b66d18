//! End-to-end sync between nodes over in-memory duplex streams

use meshkit_core::config::SyncConfig;
use meshkit_core::conflict::ConflictEngine;
use meshkit_core::crdt::{CrdtKind, GCounter, GSet, PnCounter, WorkflowCrdt};
use meshkit_core::network::{handshake, PeerState, SyncNode};
use meshkit_core::protocol::codec::read_frame;
use meshkit_core::protocol::{Hello, CAP_DELTA_STATE, PROTOCOL_VERSION};
use meshkit_core::replica::{Backlog, ReplicaStore};
use meshkit_core::sync::LamportClock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const MAX_FRAME: usize = 1024 * 1024;

fn config(id: &str, extra: &str) -> SyncConfig {
    SyncConfig::from_toml_str(&format!("replica_id = \"{}\"\n{}", id, extra)).unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn node(id: &str) -> SyncNode {
    init_tracing();
    SyncNode::from_config(config(id, "")).unwrap()
}

async fn link(a: &SyncNode, b: &SyncNode) {
    let (left, right) = tokio::io::duplex(64 * 1024);
    let (ab, ba) = tokio::join!(a.connect(left, Some(b.replica_id())), b.connect(right, None));
    assert_eq!(ab.unwrap(), b.replica_id());
    assert_eq!(ba.unwrap(), a.replica_id());
}

/// Node whose log keeps a single entry, so any backlog needs full state
fn forgetful_node(id: &str) -> SyncNode {
    init_tracing();
    let store = ReplicaStore::with_parts(id, ConflictEngine::new(id), Box::new(LamportClock::new()), 1);
    SyncNode::new(config(id, ""), Arc::new(store)).unwrap()
}

fn tag(node: &SyncNode, object: &str, element: &str) {
    node.store()
        .mutate(object, |s: &mut GSet<String>, _, _| Ok(s.insert(element.to_string())))
        .unwrap();
}

fn bump(node: &SyncNode, object: &str, amount: u64) {
    node.store()
        .mutate(object, |c: &mut PnCounter, replica, _| Ok(c.increment(replica, amount)))
        .unwrap();
}

#[tokio::test]
async fn test_two_nodes_converge() {
    let a = node("a");
    let b = node("b");
    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    b.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    link(&a, &b).await;

    bump(&a, "views", 3);
    bump(&b, "views", 5);

    let report = a.gossip_round().await;
    assert_eq!(report.targets, vec!["b".to_string()]);
    assert_eq!(report.delivered, 1);
    b.gossip_round().await;

    assert_eq!(a.store().value("views").unwrap(), json!(8));
    assert_eq!(b.store().value("views").unwrap(), json!(8));

    // Nothing new: the next round sends nothing
    assert_eq!(a.sync_with("b").await.unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_object_created_on_receipt() {
    let a = node("a");
    let b = node("b");
    link(&a, &b).await;

    a.store().create_empty("hits", CrdtKind::GCounter).unwrap();
    a.store()
        .mutate("hits", |c: &mut GCounter, replica, _| Ok(c.increment(replica, 4)))
        .unwrap();
    a.gossip_round().await;

    assert!(b.store().contains("hits"));
    assert_eq!(b.store().value("hits").unwrap(), json!(4));
    assert_eq!(b.store().version_vector().get("a"), 1);
}

#[tokio::test]
async fn test_handshake_rejects_unexpected_identity() {
    let a = node("a");
    let b = node("b");
    let (left, right) = tokio::io::duplex(64 * 1024);

    let (ab, _) = tokio::join!(a.connect(left, Some("zed")), b.connect(right, None));

    assert!(ab.is_err());
    assert!(a.connected_peers().is_empty());
    assert_eq!(a.peer_state("zed"), Some(PeerState::Disconnected));
}

#[tokio::test]
async fn test_node_rejects_store_with_other_identity() {
    let store = Arc::new(ReplicaStore::new("a"));
    assert!(SyncNode::new(config("b", ""), store).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_is_retried_then_excluded() {
    let a = SyncNode::from_config(config(
        "a",
        "[timeouts]\nround_ms = 100\n[retry]\nmax_attempts = 2\nbase_delay_ms = 10\nmax_delay_ms = 50\nexclusion_rounds = 3",
    ))
    .unwrap();
    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    bump(&a, "views", 1);

    // A peer that completes the handshake, then swallows every frame
    let (left, mut right) = tokio::io::duplex(64 * 1024);
    let ghost_hello = Hello {
        replica_id: "ghost".to_string(),
        protocol_version: PROTOCOL_VERSION,
        capabilities: vec![CAP_DELTA_STATE.to_string()],
        version_vector: HashMap::new(),
    };
    let ghost = async {
        handshake(&mut right, &ghost_hello, Some("a"), Duration::from_secs(5), MAX_FRAME)
            .await
            .unwrap();
        right
    };
    let (connected, mut right) = tokio::join!(a.connect(left, Some("ghost")), ghost);
    connected.unwrap();
    tokio::spawn(async move { while let Ok(Some(_)) = read_frame(&mut right, MAX_FRAME).await {} });

    assert!(a.sync_with("ghost").await.is_err());
    assert_eq!(a.peer_state("ghost"), Some(PeerState::Retrying));
    assert_eq!(a.metrics_snapshot().failed_rounds, 2);

    let report = a.gossip_round().await;
    assert!(report.targets.is_empty());
    let snapshot = a.metrics_snapshot();
    assert_eq!(snapshot.peers.len(), 1);
    assert_eq!(snapshot.peers[0].excluded_rounds, 2);
    assert_eq!(snapshot.peers[0].acked_seq, 0);
}

#[tokio::test]
async fn test_concurrent_workflow_flagged_on_both_nodes() {
    let a = node("a");
    let b = node("b");
    link(&a, &b).await;

    a.store().create_empty("order", CrdtKind::Workflow).unwrap();
    a.store()
        .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("pending", clock, r))
        .unwrap();
    a.gossip_round().await;
    assert_eq!(b.store().value("order").unwrap(), json!("pending"));

    a.store()
        .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("approved", clock, r))
        .unwrap();
    b.store()
        .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("rejected", clock, r))
        .unwrap();
    a.gossip_round().await;
    b.gossip_round().await;

    assert_eq!(a.store().pending_reviews().len(), 1);
    assert_eq!(b.store().pending_reviews().len(), 1);
    assert_eq!(
        a.store().value("order").unwrap(),
        b.store().value("order").unwrap()
    );
    assert!(a.metrics_snapshot().semantic_conflicts >= 1);
}

#[tokio::test]
async fn test_review_decision_reaches_peer_audit() {
    let a = node("a");
    let b = node("b");
    link(&a, &b).await;

    a.store().create_empty("order", CrdtKind::Workflow).unwrap();
    a.store()
        .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("pending", clock, r))
        .unwrap();
    a.gossip_round().await;
    a.store()
        .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("approved", clock, r))
        .unwrap();
    b.store()
        .mutate("order", |wf: &mut WorkflowCrdt, r, clock| wf.advance("rejected", clock, r))
        .unwrap();
    a.gossip_round().await;
    b.gossip_round().await;

    // b's pending entry travelled with its deltas
    assert!(a.store().audit().keys().any(|key| key.recorded_by == "b"));

    let fingerprint = a.store().pending_reviews()[0].fingerprint.clone();
    a.store().decide(&fingerprint, "approved", "reviewer-1").unwrap();
    a.gossip_round().await;

    let audit = b.store().audit();
    assert!(audit
        .entries()
        .iter()
        .any(|(key, entry)| key.recorded_by == "a" && entry.resolver == "manual:reviewer-1"));
    assert!(!b
        .store()
        .pending_reviews()
        .iter()
        .any(|entry| entry.fingerprint == fingerprint));

    // Entries b acknowledged are not sent again
    let before = a.metrics_snapshot().bytes_sent;
    assert_eq!(a.sync_with("b").await.unwrap(), 0);
    assert_eq!(a.metrics_snapshot().bytes_sent, before);
}

#[tokio::test]
async fn test_deltas_relay_through_intermediate_peer() {
    let a = node("a");
    let b = node("b");
    let c = node("c");
    link(&a, &b).await;
    link(&b, &c).await;

    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    bump(&a, "views", 3);

    a.gossip_round().await;
    let report = b.gossip_round().await;
    assert_eq!(report.targets.len(), 2);
    assert_eq!(report.failed, 0);

    assert_eq!(c.store().value("views").unwrap(), json!(3));
    assert_eq!(c.store().version_vector().get("a"), 1);
    let relayed = c.store().with_log(|log| match log.since(0) {
        Backlog::Entries(entries) => entries.iter().map(|e| e.hops).max(),
        Backlog::Truncated { .. } => None,
    });
    assert_eq!(relayed, Some(2));
}

#[tokio::test]
async fn test_truncated_log_falls_back_to_full_state() {
    let a = forgetful_node("a");
    let b = node("b");

    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    for n in 1..=3 {
        bump(&a, "views", n);
    }
    link(&a, &b).await;

    let report = a.gossip_round().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(b.store().value("views").unwrap(), json!(6));
    // What the merge added is logged under b for relay
    assert_eq!(b.store().with_log(|log| log.head()), 1);
    // The transfer covered every sequence a had issued
    assert_eq!(b.store().version_vector().get("a"), 3);
    assert_eq!(a.metrics_snapshot().peers[0].acked_seq, 3);
}

#[tokio::test]
async fn test_full_state_reaches_peer_behind_receiver() {
    let a = forgetful_node("a");
    let b = node("b");
    let c = node("c");

    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    for n in 1..=3 {
        bump(&a, "views", n);
    }
    link(&a, &b).await;
    link(&b, &c).await;

    a.gossip_round().await;
    let report = b.gossip_round().await;
    assert_eq!(report.failed, 0);

    assert_eq!(c.store().value("views").unwrap(), json!(6));
    assert_eq!(c.store().version_vector().get("b"), 1);

    // Nothing flows back to a: the relayed entry came from it
    assert_eq!(b.sync_with("a").await.unwrap(), 0);
}

#[tokio::test]
async fn test_restarted_replica_continues_origin_sequence() {
    let a = node("a");
    let b = node("b");
    link(&a, &b).await;

    a.store().create_empty("tags", CrdtKind::GSet).unwrap();
    tag(&a, "tags", "x");
    a.gossip_round().await;
    assert_eq!(b.store().version_vector().get("a"), 1);
    a.shutdown();

    // Same identity, nothing persisted, writes before reconnecting
    let restarted = node("a");
    restarted.store().create_empty("tags", CrdtKind::GSet).unwrap();
    tag(&restarted, "tags", "y");
    link(&restarted, &b).await;
    assert_eq!(restarted.store().with_log(|log| log.produced()), 2);

    restarted.gossip_round().await;
    assert_eq!(b.store().value("tags").unwrap(), json!(["x", "y"]));
    assert_eq!(b.store().version_vector().get("a"), 2);
}

#[tokio::test]
async fn test_metrics_report_reachable_peers() {
    let a = node("a");
    let b = node("b");
    link(&a, &b).await;

    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    bump(&a, "views", 2);
    a.gossip_round().await;

    let sent = a.metrics_snapshot();
    assert_eq!(sent.reachable_peers(), 1);
    assert_eq!(sent.deltas_sent, 1);
    assert_eq!(sent.sync_rounds, 1);
    assert_eq!(sent.peers[0].acked_seq, 1);

    let received = b.metrics_snapshot();
    assert_eq!(received.deltas_received, 1);
    assert!(received.bytes_received > 0);
}

#[tokio::test(start_paused = true)]
async fn test_driver_gossips_in_background() {
    let a = node("a");
    let b = node("b");
    link(&a, &b).await;
    let drivers = [a.start(), b.start()];

    a.store().create_empty("views", CrdtKind::PnCounter).unwrap();
    bump(&a, "views", 7);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(b.store().value("views").unwrap(), json!(7));

    a.shutdown();
    b.shutdown();
    for driver in drivers {
        driver.await.unwrap();
    }
}
