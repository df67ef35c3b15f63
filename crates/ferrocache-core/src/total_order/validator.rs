//! Prepare validation
//!
//! The step a total order manager hands a delivered transaction to once
//! its dependencies are satisfied.

use crate::commit_manager::TransactionCommitManager;
use crate::transaction::{CacheTransaction, ReplyHandle};
use crate::version::Version;
use crate::{Error, Result};
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Validation and commit steps applied to a delivered transaction
pub trait PrepareValidator: Send + Sync {
    /// Validate and prepare. `skip_write_skew` bypasses snapshot checks
    /// when the commit decision was already taken.
    fn prepare(&self, tx: &Arc<CacheTransaction>, skip_write_skew: bool) -> Result<Version>;

    /// Finalize at `version`
    fn commit(&self, tx: &Arc<CacheTransaction>, version: &Version) -> Result<()>;

    /// Discard
    fn rollback(&self, tx: &Arc<CacheTransaction>) -> Result<()>;

    /// Wait for the applier. With a reply handle this returns at once.
    fn await_applied(&self, tx: &Arc<CacheTransaction>, reply: Option<ReplyHandle>) -> Result<()>;
}

/// Snapshot-isolation validator on top of the commit manager
pub struct SnapshotValidator {
    commit_manager: Arc<TransactionCommitManager>,
}

impl SnapshotValidator {
    /// Create a validator for this node's commit manager
    pub fn new(commit_manager: Arc<TransactionCommitManager>) -> Self {
        Self { commit_manager }
    }

    /// Fail when a key read or written by `tx` was overwritten after its
    /// snapshot.
    ///
    /// Keys the originator recorded a writer for are checked by writer
    /// identity, which every replica agrees on. Other keys fall back to
    /// version visibility, which is only meaningful where versions are
    /// shared, as with a merged two-phase commit version.
    pub fn check_write_skew(&self, tx: &CacheTransaction) -> Result<()> {
        let container = self.commit_manager.container();
        let mut keys: BTreeSet<Bytes> = tx.write_keys();
        if let Some(reads) = tx.read_set() {
            keys.extend(reads.iter().cloned());
        }

        for key in &keys {
            let stale = match tx.observed().get(key) {
                Some(seen) => {
                    let latest = container.latest_writer_of(key);
                    let stale = latest != *seen;
                    if stale {
                        tracing::debug!(gtx = %tx.gtx(), ?seen, ?latest, "key rewritten since read");
                    }
                    stale
                }
                None => match container.latest_version_of(key) {
                    Some(latest) if !latest.visible_at(tx.snapshot()) => {
                        tracing::debug!(
                            gtx = %tx.gtx(),
                            snapshot = %tx.snapshot(),
                            %latest,
                            "write skew"
                        );
                        true
                    }
                    _ => false,
                },
            };
            if stale {
                return Err(Error::write_skew(key));
            }
        }
        Ok(())
    }
}

impl PrepareValidator for SnapshotValidator {
    fn prepare(&self, tx: &Arc<CacheTransaction>, skip_write_skew: bool) -> Result<Version> {
        if !skip_write_skew {
            self.check_write_skew(tx)?;
        }
        self.commit_manager.prepare_transaction(tx)
    }

    fn commit(&self, tx: &Arc<CacheTransaction>, version: &Version) -> Result<()> {
        self.commit_manager.commit_transaction(tx, version)
    }

    fn rollback(&self, tx: &Arc<CacheTransaction>) -> Result<()> {
        self.commit_manager.rollback_transaction(tx).map(|_| ())
    }

    fn await_applied(&self, tx: &Arc<CacheTransaction>, reply: Option<ReplyHandle>) -> Result<()> {
        self.commit_manager.await_until_committed(tx, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_log::CommitLog;
    use crate::storage::{DataContainer, InMemoryDataContainer};
    use crate::transaction::{EpochStamp, GlobalTransactionId, WriteOp};
    use crate::version::{VectorVersionGenerator, WriteVersion};

    fn validator() -> (SnapshotValidator, Arc<InMemoryDataContainer>) {
        let log = Arc::new(CommitLog::new(8));
        let container = Arc::new(InMemoryDataContainer::new());
        let generator = Arc::new(VectorVersionGenerator::new(0, log.clone()));
        let manager = Arc::new(TransactionCommitManager::new(log, container.clone(), generator));
        (SnapshotValidator::new(manager), container)
    }

    fn tx_reading(key: &str, snapshot: Version) -> Arc<CacheTransaction> {
        CacheTransaction::new(
            GlobalTransactionId::new(1, 1),
            vec![WriteOp::Put {
                key: Bytes::from("out"),
                value: Bytes::from("x"),
            }],
            Some([Bytes::copy_from_slice(key.as_bytes())].into_iter().collect()),
            snapshot,
            EpochStamp::new(0, "TO"),
        )
    }

    #[test]
    fn test_stale_read_is_write_skew() {
        let (validator, container) = validator();
        container
            .apply(
                GlobalTransactionId::new(0, 1),
                &[WriteOp::Put {
                    key: Bytes::from("in"),
                    value: Bytes::from("1"),
                }],
                &WriteVersion {
                    version: Version::from_components([(0, 5)]),
                    sub_version: 0,
                },
            )
            .unwrap();

        let stale = tx_reading("in", Version::from_components([(0, 4)]));
        let err = validator.prepare(&stale, false).unwrap_err();
        assert!(matches!(err, Error::WriteSkew { .. }));

        let fresh = tx_reading("in", Version::from_components([(0, 5)]));
        assert!(validator.check_write_skew(&fresh).is_ok());

        // Forced commits bypass the check
        let forced = tx_reading("in", Version::zero());
        assert!(validator.prepare(&forced, true).is_ok());
    }

    #[test]
    fn test_observed_writer_must_still_be_latest() {
        let (validator, container) = validator();
        let first = GlobalTransactionId::new(2, 1);
        let version = WriteVersion {
            version: Version::from_components([(2, 9)]),
            sub_version: 0,
        };
        let put = [WriteOp::Put {
            key: Bytes::from("in"),
            value: Bytes::from("1"),
        }];
        container.apply(first, &put, &version).unwrap();

        let observing = |writer: Option<GlobalTransactionId>| {
            let mut observed = crate::transaction::ObservedWriters::new();
            observed.insert(Bytes::from("in"), writer);
            CacheTransaction::with_observed(
                GlobalTransactionId::new(1, 2),
                vec![WriteOp::Put {
                    key: Bytes::from("out"),
                    value: Bytes::from("x"),
                }],
                Some([Bytes::from("in")].into_iter().collect()),
                Version::zero(),
                EpochStamp::new(0, "TO"),
                observed,
            )
        };

        // Versions from another replica are not comparable, writer ids are
        assert!(validator.check_write_skew(&observing(Some(first))).is_ok());
        assert!(matches!(
            validator.check_write_skew(&observing(None)),
            Err(Error::WriteSkew { .. })
        ));
    }
}
