//! Commit log - the node's visibility watermark
//!
//! The applier pushes each committed batch here in one step; snapshot
//! readers pick their version from [`CommitLog::current_version`] and can
//! wait for a version to become visible.

use crate::transaction::{GlobalTransactionId, WriteOp};
use crate::version::{CausalOrder, Version};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Immutable record of a transaction handed to the applier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedTransactionRecord {
    gtx: GlobalTransactionId,
    version: Version,
    sub_version: u32,
    write_set: Vec<WriteOp>,
}

impl CommittedTransactionRecord {
    /// Snapshot a transaction at its commit version
    pub fn new(
        gtx: GlobalTransactionId,
        version: Version,
        sub_version: u32,
        write_set: Vec<WriteOp>,
    ) -> Self {
        Self {
            gtx,
            version,
            sub_version,
            write_set,
        }
    }

    /// Transaction id
    pub fn gtx(&self) -> GlobalTransactionId {
        self.gtx
    }

    /// Commit version
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Position among transactions sharing the commit version
    pub fn sub_version(&self) -> u32 {
        self.sub_version
    }

    /// Applied writes
    pub fn write_set(&self) -> &[WriteOp] {
        &self.write_set
    }
}

/// One applier batch as recorded in the log history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBatch {
    /// Watermark after this batch
    pub version: Version,
    /// Transactions in sub-version order
    pub transactions: Vec<GlobalTransactionId>,
}

struct CommitLogInner {
    most_recent: Version,
    history: VecDeque<CommittedBatch>,
    committed: u64,
}

/// Visibility watermark and recent commit history
pub struct CommitLog {
    inner: Mutex<CommitLogInner>,
    advanced: Condvar,
    history_limit: usize,
}

impl CommitLog {
    /// Create an empty log keeping at most `history_limit` batches
    pub fn new(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(CommitLogInner {
                most_recent: Version::zero(),
                history: VecDeque::with_capacity(history_limit.min(1024)),
                committed: 0,
            }),
            advanced: Condvar::new(),
            history_limit: history_limit.max(1),
        }
    }

    /// Most recent visible version
    pub fn current_version(&self) -> Version {
        self.inner.lock().most_recent.clone()
    }

    /// Publish an applier batch in one visibility bump
    pub fn insert_new_committed_versions(&self, records: &[CommittedTransactionRecord]) {
        if records.is_empty() {
            return;
        }

        let mut inner = self.inner.lock();
        let mut most_recent = inner.most_recent.clone();
        for record in records {
            most_recent = most_recent.merge(record.version());
        }
        inner.most_recent = most_recent.clone();
        inner.committed += records.len() as u64;
        if inner.history.len() >= self.history_limit {
            inner.history.pop_front();
        }
        inner.history.push_back(CommittedBatch {
            version: most_recent,
            transactions: records.iter().map(|r| r.gtx()).collect(),
        });
        self.advanced.notify_all();
    }

    /// Advance visibility without a batch (read-only commits)
    pub fn update_most_recent_version(&self, version: &Version) {
        let mut inner = self.inner.lock();
        inner.most_recent = inner.most_recent.merge(version);
        self.advanced.notify_all();
    }

    /// Block until `version` is visible. Returns false on timeout.
    pub fn wait_for_version(&self, version: &Version, timeout: Duration) -> bool {
        let covers = |current: &Version| {
            matches!(
                current.causal_compare(version),
                CausalOrder::After | CausalOrder::Equal
            )
        };

        let mut inner = self.inner.lock();
        if !covers(&inner.most_recent) {
            let _ = self
                .advanced
                .wait_while_for(&mut inner, |i| !covers(&i.most_recent), timeout);
        }
        covers(&inner.most_recent)
    }

    /// Recent batches, oldest first
    pub fn history(&self) -> Vec<CommittedBatch> {
        self.inner.lock().history.iter().cloned().collect()
    }

    /// Transactions published so far
    pub fn committed_count(&self) -> u64 {
        self.inner.lock().committed
    }
}
