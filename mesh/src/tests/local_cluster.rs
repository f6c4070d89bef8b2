//! Multi-node scenarios over the in-process network.

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use super::test_utils::{init_test_logging, wait_for, TestNode};
use crate::{
    broadcast::retransmit_limit,
    codec::MutationMessage,
    membership::{ClusterConfig, Node},
    reconcile::{apply_mutation, ApplyOutcome, ReconcilerConfig},
    transport::LocalNetwork,
};

fn node(name: &str, port: u16) -> Node {
    Node::new(name, "127.0.0.1", port)
}

async fn cluster_of(network: &LocalNetwork, names: &[&str], config: ClusterConfig) -> Vec<TestNode> {
    let mut nodes = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let n = TestNode::create(node(name, 7947 + i as u16), network, config.clone()).await;
        if i > 0 {
            n.cluster.join(&[names[0].to_string()]).await.unwrap();
        }
        nodes.push(n);
    }
    nodes
}

fn quick_reconciler() -> ReconcilerConfig {
    ReconcilerConfig {
        member_report_interval: Duration::from_millis(50),
        leave_timeout: Duration::from_millis(200),
        ..ReconcilerConfig::default()
    }
}

#[tokio::test]
async fn test_set_propagates_between_two_nodes() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    assert_eq!(nodes[0].cluster.live_nodes(), 2);
    assert_eq!(nodes[1].cluster.live_nodes(), 2);
    assert_eq!(nodes[1].cluster.members().len(), 2);

    nodes[0].put("foo", "bar");
    assert_eq!(network.gossip_round(), 1);
    nodes[1].drain_inbound();

    assert_eq!(nodes[1].store.get("foo").as_deref(), Some("bar"));
}

#[tokio::test]
async fn test_delete_propagates() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    nodes[0].put("k", "v");
    network.gossip_round();
    nodes[1].drain_inbound();
    assert!(nodes[1].store.contains_key("k"));

    nodes[0].remove("k");
    for _ in 0..5 {
        network.gossip_round();
    }
    nodes[1].drain_inbound();
    assert!(!nodes[1].store.contains_key("k"));
}

#[tokio::test]
async fn test_broadcast_stops_after_retransmit_limit() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b", "c"], ClusterConfig::default()).await;

    nodes[0].put("k", "v");
    let limit = retransmit_limit(3, 3);
    assert_eq!(nodes[0].cluster.broadcasts().retransmit_limit(), limit);

    let mut delivered = 0;
    for _ in 0..10 {
        delivered += network.gossip_round();
    }
    assert_eq!(delivered, limit);
    assert!(nodes[0].cluster.broadcasts().is_empty());

    for n in nodes.iter_mut().skip(1) {
        n.drain_inbound();
        assert_eq!(n.store.get("k").as_deref(), Some("v"));
    }
}

#[tokio::test]
async fn test_reordered_delivery_keeps_latest_write() {
    init_test_logging();
    let network = LocalNetwork::new();
    let nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    nodes[0].put("x", "1");
    tokio::time::sleep(Duration::from_millis(2)).await;
    nodes[0].put("x", "2");

    // Take both in flight and deliver them newest first.
    let mut in_flight = nodes[0].cluster.broadcasts().get_broadcasts(0, usize::MAX);
    assert_eq!(in_flight.len(), 2);
    in_flight.reverse();

    for bytes in &in_flight {
        let msg = MutationMessage::decode(bytes).unwrap();
        apply_mutation(&nodes[1].store, &msg);
    }
    assert_eq!(nodes[1].store.get("x").as_deref(), Some("2"));
    assert_eq!(nodes[0].store.get("x").as_deref(), Some("2"));
}

#[tokio::test]
async fn test_untimestamped_messages_apply_in_arrival_order() {
    init_test_logging();
    let network = LocalNetwork::new();
    let nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    // Senders that do not stamp their messages get arrival-order semantics.
    let first = MutationMessage::set("x", "1");
    let second = MutationMessage::set("x", "2");
    apply_mutation(&nodes[1].store, &second);
    apply_mutation(&nodes[1].store, &first);

    assert_eq!(nodes[1].store.get("x").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_concurrent_writes_converge_on_newest() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b", "c"], ClusterConfig::default()).await;

    let t0 = Utc::now();
    let older = MutationMessage::set("k", "from-a").with_timestamp(t0);
    let newer = MutationMessage::set("k", "from-c").with_timestamp(t0 + ChronoDuration::seconds(1));
    apply_mutation(&nodes[0].store, &older);
    apply_mutation(&nodes[2].store, &newer);
    nodes[0].cluster.queue_broadcast(&older);
    nodes[2].cluster.queue_broadcast(&newer);

    for _ in 0..10 {
        network.gossip_round();
        for n in nodes.iter_mut() {
            n.drain_inbound();
        }
    }

    for n in &nodes {
        assert_eq!(n.store.get("k").as_deref(), Some("from-c"), "node {}", n.name());
    }
}

#[tokio::test]
async fn test_replayed_broadcast_is_stale() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    nodes[0].put("k", "v");
    let payload = nodes[0].cluster.broadcasts().pending()[0].payload().to_vec();

    nodes[1].inbound_tx.try_send(payload.clone()).unwrap();
    nodes[1].inbound_tx.try_send(payload).unwrap();
    let outcomes = nodes[1].drain_inbound();

    assert_eq!(outcomes, vec![ApplyOutcome::Applied, ApplyOutcome::Stale]);
    assert_eq!(nodes[1].store.len(), 1);
}

#[tokio::test]
async fn test_reconciler_survives_malformed_input() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;
    let (shutdown, handle) = nodes[1].spawn_reconciler(quick_reconciler());

    nodes[1].inbound_tx.send(b"not json".to_vec()).await.unwrap();
    nodes[1]
        .inbound_tx
        .send(br#"{"operation":"append","key":"k","value":"v"}"#.to_vec())
        .await
        .unwrap();
    nodes[0].put("after", "garbage");
    network.gossip_round();

    let store = nodes[1].store.clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            let store = store.clone();
            async move { store.contains_key("after") }
        })
        .await
    );

    shutdown.send(true).unwrap();
    let stats = handle.await.unwrap();
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.ignored, 1);
    assert_eq!(stats.applied, 1);
}

#[tokio::test]
async fn test_reconciler_reports_members_and_leaves_on_shutdown() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;
    let (shutdown, handle) = nodes[0].spawn_reconciler(quick_reconciler());

    tokio::time::sleep(Duration::from_millis(120)).await;
    shutdown.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert!(stats.member_reports >= 1);
    assert_eq!(nodes[1].cluster.live_nodes(), 1);
    assert_eq!(nodes[1].cluster.members().len(), 1);
    assert_eq!(network.joined(), Vec::<String>::new());
}

#[tokio::test]
async fn test_shutdown_before_start_still_leaves() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b", "c"], ClusterConfig::default()).await;

    let (shutdown, handle) = {
        let (tx, rx) = tokio::sync::watch::channel(true);
        let inbound = nodes[2].inbound.take().unwrap();
        let reconciler = crate::reconcile::Reconciler::new(
            nodes[2].cluster.clone(),
            nodes[2].store.clone(),
            inbound,
            quick_reconciler(),
        );
        (tx, tokio::spawn(reconciler.run(rx)))
    };

    let stats = handle.await.unwrap();
    drop(shutdown);
    assert_eq!(stats.received, 0);
    assert_eq!(nodes[0].cluster.live_nodes(), 2);
    assert_eq!(nodes[1].cluster.live_nodes(), 2);
}

#[tokio::test]
async fn test_leave_timeout_is_absorbed() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;
    let (shutdown, handle) = nodes[0].spawn_reconciler(quick_reconciler());

    network.partition("a");
    shutdown.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert_eq!(stats.received, 0);
    // The provider still shuts down, so the survivor notices the departure.
    assert_eq!(nodes[1].cluster.live_nodes(), 1);
}

#[tokio::test]
async fn test_partitioned_node_misses_broadcasts() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    network.partition("b");
    nodes[0].put("k", "v");
    for _ in 0..5 {
        network.gossip_round();
    }
    network.heal("b");
    network.gossip_round();

    nodes[1].drain_inbound();
    assert!(nodes[1].store.get("k").is_none());
    assert!(nodes[0].cluster.broadcasts().is_empty());
}

#[tokio::test]
async fn test_anti_entropy_recovers_missed_writes() {
    init_test_logging();
    let network = LocalNetwork::new();
    let config = ClusterConfig {
        anti_entropy: true,
        ..ClusterConfig::default()
    };
    let nodes = cluster_of(&network, &["a", "b"], config).await;

    network.partition("b");
    nodes[0].put("k", "v");
    nodes[1].put("other", "w");
    for _ in 0..5 {
        network.gossip_round();
    }
    assert!(!network.push_pull("a", "b"));

    network.heal("b");
    assert!(network.push_pull("a", "b"));
    assert_eq!(nodes[1].store.get("k").as_deref(), Some("v"));
    assert_eq!(nodes[0].store.get("other").as_deref(), Some("w"));
}

#[tokio::test]
async fn test_anti_entropy_respects_recent_delete() {
    init_test_logging();
    let network = LocalNetwork::new();
    let config = ClusterConfig {
        anti_entropy: true,
        ..ClusterConfig::default()
    };
    let nodes = cluster_of(&network, &["a", "b"], config).await;

    nodes[0].put("k", "v");
    assert!(network.push_pull("a", "b"));
    nodes[0].store.delete("k");

    assert!(network.push_pull("a", "b"));
    assert!(nodes[0].store.get("k").is_none());
}

#[tokio::test]
async fn test_anti_entropy_resurrects_after_tombstone_pruned() {
    init_test_logging();
    let network = LocalNetwork::new();
    let config = ClusterConfig {
        anti_entropy: true,
        ..ClusterConfig::default()
    };
    let nodes = cluster_of(&network, &["a", "b"], config).await;

    nodes[0].put("k", "v");
    assert!(network.push_pull("a", "b"));
    nodes[0].store.delete("k");
    nodes[0]
        .store
        .prune_tombstones(Utc::now() + ChronoDuration::seconds(1));

    assert!(network.push_pull("a", "b"));
    assert_eq!(nodes[0].store.get("k").as_deref(), Some("v"));
}

#[tokio::test]
async fn test_delete_overtaking_older_set_keeps_key_deleted() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;

    let t1 = Utc::now();
    let t2 = t1 + ChronoDuration::milliseconds(1);
    nodes[0].store.merge_entry("x".into(), crate::store::StoredValue::new("1", t1));
    nodes[0].store.delete_if_not_newer("x", t2);

    // The delete reaches b ahead of the set it supersedes.
    let delete = MutationMessage::delete("x").with_timestamp(t2);
    let set = MutationMessage::set("x", "1").with_timestamp(t1);
    nodes[1].inbound_tx.send(delete.encode()).await.unwrap();
    nodes[1].inbound_tx.send(set.encode()).await.unwrap();

    assert_eq!(
        nodes[1].drain_inbound(),
        vec![ApplyOutcome::NoOp, ApplyOutcome::Stale]
    );
    assert_eq!(nodes[0].store.get("x"), None);
    assert_eq!(nodes[1].store.get("x"), None);
}

#[tokio::test]
async fn test_reconciler_prunes_expired_tombstones() {
    init_test_logging();
    let network = LocalNetwork::new();
    let mut nodes = cluster_of(&network, &["a", "b"], ClusterConfig::default()).await;
    nodes[0].store.set("k", "v");
    nodes[0].store.delete("k");
    assert_eq!(nodes[0].store.tombstone_count(), 1);

    let config = ReconcilerConfig {
        tombstone_ttl: Duration::ZERO,
        ..quick_reconciler()
    };
    let (shutdown, handle) = nodes[0].spawn_reconciler(config);

    let store = nodes[0].store.clone();
    assert!(
        wait_for(Duration::from_secs(2), || {
            let store = store.clone();
            async move { store.tombstone_count() == 0 }
        })
        .await
    );

    shutdown.send(true).unwrap();
    let stats = handle.await.unwrap();
    assert_eq!(stats.tombstones_pruned, 1);
}

#[tokio::test]
async fn test_join_through_unknown_seed_fails() {
    init_test_logging();
    let network = LocalNetwork::new();
    let n = TestNode::create(node("solo", 7947), &network, ClusterConfig::default()).await;

    assert_eq!(n.cluster.join(&[]).await.unwrap(), 0);
    assert!(n.cluster.join(&["10.0.0.9:7947".to_string()]).await.is_err());
    assert_eq!(n.cluster.live_nodes(), 1);
    assert_eq!(n.cluster.members(), vec![node("solo", 7947)]);
}
