//! Three nodes on a loopback network, driven through every protocol

mod common;

use bytes::Bytes;
use common::Cluster;
use ferrocache_core::{
    Error, PASSIVE_REPLICATION, SwitchStatus, TOTAL_ORDER, TWO_PHASE_COMMIT, TotalOrderManager,
    ValidationStrategy,
};

fn assert_everywhere(cluster: &Cluster, key: &str, value: &str) {
    assert!(
        cluster.await_replicated(key, Some(value)),
        "{} did not reach {:?} on every node",
        key,
        value
    );
}

fn read(cluster: &Cluster, id: u32, key: &str) -> Option<Bytes> {
    let node = cluster.node(id);
    let mut tx = node.begin().unwrap();
    node.read(&mut tx, key.as_bytes())
}

#[test]
fn test_two_phase_commit_replicates_to_every_node() {
    let cluster = Cluster::start(3, |c| c).unwrap();
    cluster.put(1, "a", "1").unwrap();
    cluster.put(2, "b", "2").unwrap();
    assert_everywhere(&cluster, "a", "1");
    assert_everywhere(&cluster, "b", "2");

    assert!(common::wait_until(std::time::Duration::from_secs(5), || {
        read(&cluster, 3, "a") == Some(Bytes::from("1"))
    }));
}

#[test]
fn test_two_phase_commit_rejects_stale_read() {
    let cluster = Cluster::start(3, |c| c).unwrap();
    cluster.put(1, "a", "1").unwrap();
    assert_everywhere(&cluster, "a", "1");

    let node = cluster.node(1);
    let mut stale = node.begin().unwrap();
    assert_eq!(node.read(&mut stale, b"a"), Some(Bytes::from("1")));

    cluster.put(2, "a", "2").unwrap();
    assert_everywhere(&cluster, "a", "2");

    stale.put("a", "3");
    assert!(node.commit(stale).is_err());
    assert_everywhere(&cluster, "a", "2");
}

#[test]
fn test_switch_whole_cluster_through_every_protocol() {
    let cluster = Cluster::start(3, |c| c).unwrap();
    cluster.put(1, "k", "2pc").unwrap();
    assert_everywhere(&cluster, "k", "2pc");

    // Non-blocking switch on every node
    cluster.switch_all(TOTAL_ORDER, false).unwrap();
    for node in &cluster.nodes {
        assert_eq!(node.replication().current_protocol_id(), TOTAL_ORDER);
        assert_eq!(node.replication().current_epoch(), 1);
        assert_eq!(node.replication().status(), SwitchStatus::Safe);
    }
    cluster.put(3, "k", "to").unwrap();
    assert_everywhere(&cluster, "k", "to");
    cluster.put(2, "other", "x").unwrap();
    assert_everywhere(&cluster, "other", "x");

    // Stop-the-world switch to primary-backup
    cluster.switch_all(PASSIVE_REPLICATION, true).unwrap();
    for node in &cluster.nodes {
        assert_eq!(node.replication().current_epoch(), 2);
    }
    cluster.put(1, "k", "pb").unwrap();
    assert_everywhere(&cluster, "k", "pb");

    let err = cluster.put(2, "k", "backup").unwrap_err();
    assert!(matches!(err, Error::TransactionAborted(_)), "got {:?}", err);
    assert_everywhere(&cluster, "k", "pb");

    cluster.switch_all(TWO_PHASE_COMMIT, true).unwrap();
    cluster.put(2, "k", "back").unwrap();
    assert_everywhere(&cluster, "k", "back");
}

#[test]
fn test_parallel_total_order_keeps_replicas_identical() {
    let cluster = Cluster::start(3, |c| {
        c.with_default_protocol(TOTAL_ORDER)
            .with_validation(ValidationStrategy::Parallel)
            .with_validation_workers(2)
    })
    .unwrap();

    for round in 0..10 {
        let origin = round % 3 + 1;
        let value = format!("v{}", round);
        cluster.put(origin, "hot", &value).unwrap();
        assert_everywhere(&cluster, "hot", &value);
        cluster
            .put(origin, &format!("cold{}", round), &value)
            .unwrap();
    }
    for round in 0..10 {
        assert_everywhere(&cluster, &format!("cold{}", round), &format!("v{}", round));
    }
    for node in &cluster.nodes {
        assert!(common::wait_until(std::time::Duration::from_secs(5), || {
            node.total_order().core().registered_keys() == 0
        }));
    }
}

#[test]
fn test_total_order_conflict_aborts_on_every_replica() {
    let cluster = Cluster::start(3, |c| c.with_default_protocol(TOTAL_ORDER)).unwrap();
    cluster.put(1, "a", "1").unwrap();
    assert_everywhere(&cluster, "a", "1");

    let node = cluster.node(2);
    let mut stale = node.begin().unwrap();
    assert_eq!(node.read(&mut stale, b"a"), Some(Bytes::from("1")));

    cluster.put(3, "a", "2").unwrap();
    assert_everywhere(&cluster, "a", "2");

    stale.put("a", "3");
    stale.put("side", "effect");
    assert!(node.commit(stale).is_err());
    for container in &cluster.containers {
        assert_eq!(container.latest(b"side"), None);
    }
    assert_everywhere(&cluster, "a", "2");
}

#[test]
fn test_undelivered_total_order_commit_is_dropped() {
    let cluster = Cluster::start(3, |c| c.with_default_protocol(TOTAL_ORDER)).unwrap();
    let node = cluster.node(1);

    let mut tx = node.begin().unwrap();
    let gtx = tx.gtx();
    tx.put("k", "lost");

    // The sequencer reaches node 1 first, so nothing is delivered anywhere
    cluster.network.isolate(1);
    let err = node.commit(tx).unwrap_err();
    assert!(matches!(err, Error::Transport(_)), "got {:?}", err);

    let core = node.total_order().core();
    assert!(core.is_finished(gtx));
    assert_eq!(core.tracked_transactions(), 0);
    assert_eq!(core.registered_keys(), 0);
    for container in &cluster.containers {
        assert_eq!(container.latest(b"k"), None);
    }

    cluster.network.heal(1);
    cluster.put(1, "k", "kept").unwrap();
    assert_everywhere(&cluster, "k", "kept");
}

#[test]
fn test_passive_primary_rejects_stale_read_and_releases_locks() {
    let cluster = Cluster::start(3, |c| c.with_default_protocol(PASSIVE_REPLICATION)).unwrap();
    cluster.put(1, "a", "1").unwrap();

    let node = cluster.node(1);
    let mut stale = node.begin().unwrap();
    assert_eq!(node.read(&mut stale, b"a"), Some(Bytes::from("1")));
    cluster.put(1, "a", "2").unwrap();

    stale.put("a", "3");
    assert!(node.commit(stale).is_err());

    cluster.put(1, "a", "4").unwrap();
    assert_everywhere(&cluster, "a", "4");
}
