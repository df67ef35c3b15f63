//! Commit manager and applier integration tests

mod common;

use bytes::Bytes;
use ferrocache_core::version::VectorVersionGenerator;
use ferrocache_core::{
    CacheTransaction, CommitLog, EpochStamp, GlobalTransactionId, InMemoryDataContainer,
    TransactionCommitManager, Version, WriteOp,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const NODE: u32 = 1;

fn manager() -> (Arc<TransactionCommitManager>, Arc<InMemoryDataContainer>) {
    common::init_tracing();
    let log = Arc::new(CommitLog::new(64));
    let container = Arc::new(InMemoryDataContainer::new());
    let generator = Arc::new(VectorVersionGenerator::new(NODE, log.clone()));
    let manager = Arc::new(TransactionCommitManager::new(log, container.clone(), generator));
    manager.start().unwrap();
    (manager, container)
}

fn put(id: u64, key: &str) -> Arc<CacheTransaction> {
    CacheTransaction::new(
        GlobalTransactionId::new(NODE, id),
        vec![WriteOp::Put {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::from(format!("t{}", id)),
        }],
        None,
        Version::zero(),
        EpochStamp::new(0, "2PC"),
    )
}

fn at(order: u64) -> Version {
    Version::from_components([(NODE, order)])
}

#[test]
fn test_equal_final_versions_share_a_batch() {
    let (manager, container) = manager();
    let blocker = put(1, "blocker");
    let t3 = put(3, "k");
    let t4 = put(4, "k");
    manager.prepare_transaction(&blocker).unwrap();
    manager.prepare_transaction(&t3).unwrap();
    manager.prepare_transaction(&t4).unwrap();

    // Both finalized while the head is still pending
    manager.commit_transaction(&t3, &at(7)).unwrap();
    manager.commit_transaction(&t4, &at(7)).unwrap();
    manager.commit_transaction(&blocker, &at(5)).unwrap();

    manager.await_until_committed(&t3, None).unwrap();
    manager.await_until_committed(&t4, None).unwrap();

    let versions = container.versions_of(b"k");
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].version, at(7));
    assert_eq!(versions[0].sub_version, 0);
    assert_eq!(versions[1].sub_version, 1);
    assert_eq!(container.latest(b"k"), Some(Bytes::from("t4")));

    let history = manager.commit_log().history();
    let batch = history.last().unwrap();
    assert_eq!(batch.transactions, vec![t3.gtx(), t4.gtx()]);
}

#[test]
fn test_read_only_commit_bypasses_queue() {
    let (manager, container) = manager();
    let tx = CacheTransaction::without_footprint(
        GlobalTransactionId::new(2, 9),
        EpochStamp::new(0, "2PC"),
    );
    let version = Version::from_components([(NODE, 4), (2, 11)]);

    assert!(!manager.queue().commit(&tx, &version).unwrap());
    manager.commit_transaction(&tx, &version).unwrap();

    assert!(manager.queue().is_empty());
    assert_eq!(manager.commit_log().current_version(), version);
    assert_eq!(manager.stats().read_only_commits, 1);
    assert_eq!(container.applied_count(), 0);
    manager.await_until_committed(&tx, None).unwrap();
}

#[test]
fn test_applier_drains_in_version_order() {
    let (manager, container) = manager();
    let txs: Vec<_> = (1..=5).map(|id| put(id, "k")).collect();
    let versions: Vec<_> = txs
        .iter()
        .map(|tx| manager.prepare_transaction(tx).unwrap())
        .collect();

    // Finalize back to front; the applier still goes front to back
    for (tx, version) in txs.iter().zip(&versions).rev() {
        manager.commit_transaction(tx, version).unwrap();
    }
    for tx in &txs {
        manager.await_until_committed(tx, None).unwrap();
    }

    let orders: Vec<u64> = container
        .versions_of(b"k")
        .iter()
        .map(|v| v.version.get(NODE))
        .collect();
    assert_eq!(orders, vec![1, 2, 3, 4, 5]);
    assert_eq!(container.latest(b"k"), Some(Bytes::from("t5")));
    assert_eq!(manager.stats().ordering_violations, 0);
}

#[test]
fn test_visibility_waits_for_applier() {
    let (manager, _) = manager();
    let tx = put(1, "k");
    let version = manager.prepare_transaction(&tx).unwrap();
    assert!(!manager.commit_log().wait_for_version(&version, Duration::from_millis(10)));

    manager.commit_transaction(&tx, &version).unwrap();
    assert!(manager.commit_log().wait_for_version(&version, Duration::from_secs(5)));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn next_prepare_exceeds_every_final_version(finals in prop::collection::vec(1u64..200, 1..8)) {
        let (manager, _) = manager();
        for (i, bump) in finals.iter().enumerate() {
            let tx = put(i as u64 + 1, "k");
            let provisional = manager.prepare_transaction(&tx).unwrap();
            let final_version = at(provisional.get(NODE) + bump);
            manager.commit_transaction(&tx, &final_version).unwrap();

            let sample = put(1000 + i as u64, "sample");
            let next = manager.prepare_transaction(&sample).unwrap();
            prop_assert!(next.get(NODE) > final_version.get(NODE));
            manager.rollback_transaction(&sample).unwrap();
        }
        manager.shutdown();
    }
}
