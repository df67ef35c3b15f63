//! Transactions
//!
//! A [`CacheTransaction`] is the node-local record of one distributed
//! transaction: write set, optional read set, current version, lifecycle
//! state and dependency latch. [`LocalTransaction`] is the builder handed to
//! callers on the originating node.

use crate::latch::{DependencyLatch, LatchOutcome};
use crate::version::{NodeId, Version};
use crate::{Error, Result};
use bytes::Bytes;
use crossbeam_channel::{Receiver, bounded};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Writer of each key as seen by the originator's snapshot. `None` means
/// the key had no visible value.
pub type ObservedWriters = BTreeMap<Bytes, Option<GlobalTransactionId>>;

/// Cluster-wide transaction identity: originating node plus local counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GlobalTransactionId {
    /// Originating node
    pub origin: NodeId,
    /// Counter local to the origin
    pub id: u64,
}

impl GlobalTransactionId {
    /// Create a transaction id
    pub fn new(origin: NodeId, id: u64) -> Self {
        Self { origin, id }
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gtx[{}:{}]", self.origin, self.id)
    }
}

/// One write in a write set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Store `value` under `key`
    Put {
        /// Key
        key: Bytes,
        /// Value
        value: Bytes,
    },
    /// Remove `key`
    Remove {
        /// Key
        key: Bytes,
    },
}

impl WriteOp {
    /// Key touched by this write
    pub fn key(&self) -> &Bytes {
        match self {
            Self::Put { key, .. } | Self::Remove { key } => key,
        }
    }
}

/// `(epoch, protocol)` stamp a transaction was admitted under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EpochStamp {
    /// Protocol generation
    pub epoch: u64,
    /// Protocol id
    pub protocol_id: String,
}

impl EpochStamp {
    /// Create a stamp
    pub fn new(epoch: u64, protocol_id: impl Into<String>) -> Self {
        Self {
            epoch,
            protocol_id: protocol_id.into(),
        }
    }
}

/// Transaction lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxState {
    /// Being validated
    Preparing,
    /// Holds a provisional version and a queue position
    Prepared,
    /// Final version assigned, waiting for the applier
    Committing,
    /// Applied (or skipped) by the applier
    Committed,
    /// Discarded
    RolledBack,
}

impl TxState {
    /// Committed or rolled back
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Outcome reported to commit waiters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The transaction is visible in storage
    Committed,
    /// The transaction was removed before commit
    RolledBack,
    /// The node shut down with the transaction still queued
    Abandoned,
}

/// Callback fired once when a queued transaction leaves the queue.
/// Used by remote validation paths so they never block on the applier.
pub struct ReplyHandle(Box<dyn FnOnce(CommitOutcome) + Send>);

impl ReplyHandle {
    /// Wrap a callback
    pub fn new(f: impl FnOnce(CommitOutcome) + Send + 'static) -> Self {
        Self(Box::new(f))
    }

    /// Reply handle that forwards the outcome into a channel
    pub fn channel() -> (Self, Receiver<CommitOutcome>) {
        let (tx, rx) = bounded(1);
        let handle = Self::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (handle, rx)
    }

    /// Deliver the outcome
    pub fn send(self, outcome: CommitOutcome) {
        (self.0)(outcome)
    }
}

impl fmt::Debug for ReplyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ReplyHandle")
    }
}

struct TxInner {
    version: Version,
    state: TxState,
}

/// Node-local record of a distributed transaction
pub struct CacheTransaction {
    gtx: GlobalTransactionId,
    write_set: Vec<WriteOp>,
    read_set: Option<BTreeSet<Bytes>>,
    snapshot: Version,
    stamp: EpochStamp,
    observed: ObservedWriters,
    inner: Mutex<TxInner>,
    latch: Arc<DependencyLatch>,
}

impl CacheTransaction {
    /// Create a transaction in state `Preparing`
    pub fn new(
        gtx: GlobalTransactionId,
        write_set: Vec<WriteOp>,
        read_set: Option<BTreeSet<Bytes>>,
        snapshot: Version,
        stamp: EpochStamp,
    ) -> Arc<Self> {
        Self::with_observed(gtx, write_set, read_set, snapshot, stamp, ObservedWriters::new())
    }

    /// Create a transaction carrying the writers its originator observed
    pub fn with_observed(
        gtx: GlobalTransactionId,
        write_set: Vec<WriteOp>,
        read_set: Option<BTreeSet<Bytes>>,
        snapshot: Version,
        stamp: EpochStamp,
        observed: ObservedWriters,
    ) -> Arc<Self> {
        Arc::new(Self {
            gtx,
            write_set,
            read_set,
            observed,
            inner: Mutex::new(TxInner {
                version: snapshot.clone(),
                state: TxState::Preparing,
            }),
            snapshot,
            stamp,
            latch: Arc::new(DependencyLatch::new(gtx)),
        })
    }

    /// Placeholder for a transaction with no local footprint
    pub fn without_footprint(gtx: GlobalTransactionId, stamp: EpochStamp) -> Arc<Self> {
        Self::new(gtx, Vec::new(), None, Version::zero(), stamp)
    }

    /// Transaction id
    pub fn gtx(&self) -> GlobalTransactionId {
        self.gtx
    }

    /// Ordered write set
    pub fn write_set(&self) -> &[WriteOp] {
        &self.write_set
    }

    /// Read set, when the originator tracked one
    pub fn read_set(&self) -> Option<&BTreeSet<Bytes>> {
        self.read_set.as_ref()
    }

    /// Snapshot the transaction read from
    pub fn snapshot(&self) -> &Version {
        &self.snapshot
    }

    /// Admission stamp
    pub fn stamp(&self) -> &EpochStamp {
        &self.stamp
    }

    /// Writers observed by the originator, per key
    pub fn observed(&self) -> &ObservedWriters {
        &self.observed
    }

    /// Distinct keys written, in key order
    pub fn write_keys(&self) -> BTreeSet<Bytes> {
        self.write_set.iter().map(|op| op.key().clone()).collect()
    }

    /// No writes
    pub fn is_read_only(&self) -> bool {
        self.write_set.is_empty()
    }

    /// Current (provisional or final) version
    pub fn version(&self) -> Version {
        self.inner.lock().version.clone()
    }

    /// Replace the current version
    pub fn set_version(&self, version: Version) {
        self.inner.lock().version = version;
    }

    /// Lifecycle state
    pub fn state(&self) -> TxState {
        self.inner.lock().state
    }

    /// Move to `next`. Terminal states are final.
    pub fn transition(&self, next: TxState) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() && inner.state != next {
            return Err(Error::transaction(format!(
                "{} cannot move from {:?} to {:?}",
                self.gtx, inner.state, next
            )));
        }
        inner.state = next;
        Ok(())
    }

    /// Dependency latch owned by this transaction
    pub fn latch(&self) -> &Arc<DependencyLatch> {
        &self.latch
    }

    /// Latch outcome matching the current state
    pub fn latch_outcome(&self) -> LatchOutcome {
        match self.state() {
            TxState::Committed => LatchOutcome::Committed,
            TxState::RolledBack => LatchOutcome::RolledBack,
            _ => LatchOutcome::Failed,
        }
    }
}

impl fmt::Debug for CacheTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CacheTransaction")
            .field("gtx", &self.gtx)
            .field("writes", &self.write_set.len())
            .field("version", &inner.version)
            .field("state", &inner.state)
            .finish()
    }
}

/// First-wins completion slot a local thread blocks on while remote
/// machinery (e.g. total order validation) decides its transaction.
#[derive(Default)]
pub struct TransactionCompletion {
    result: Mutex<Option<Result<()>>>,
    done: Condvar,
}

impl TransactionCompletion {
    /// Create an empty completion
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the result. Returns false if already completed.
    pub fn complete(&self, result: Result<()>) -> bool {
        let mut slot = self.result.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        self.done.notify_all();
        true
    }

    /// Whether a result was recorded
    pub fn is_complete(&self) -> bool {
        self.result.lock().is_some()
    }

    /// Block until completed or `timeout` elapses
    pub fn wait(&self, timeout: Duration) -> Result<()> {
        let mut slot = self.result.lock();
        if slot.is_none() {
            let _ = self
                .done
                .wait_while_for(&mut slot, |r| r.is_none(), timeout);
        }
        match slot.as_ref() {
            Some(result) => result.clone(),
            None => Err(Error::DependencyTimeout(format!(
                "no outcome after {:?}",
                timeout
            ))),
        }
    }
}

/// Transaction being built on its originating node
pub struct LocalTransaction {
    gtx: GlobalTransactionId,
    snapshot: Version,
    writes: Vec<WriteOp>,
    reads: BTreeSet<Bytes>,
    observed: ObservedWriters,
    stamp: Option<EpochStamp>,
    completion: Arc<TransactionCompletion>,
}

impl LocalTransaction {
    /// Start a transaction reading from `snapshot`
    pub fn new(gtx: GlobalTransactionId, snapshot: Version) -> Self {
        Self {
            gtx,
            snapshot,
            writes: Vec::new(),
            reads: BTreeSet::new(),
            observed: ObservedWriters::new(),
            stamp: None,
            completion: TransactionCompletion::new(),
        }
    }

    /// Transaction id
    pub fn gtx(&self) -> GlobalTransactionId {
        self.gtx
    }

    /// Snapshot version
    pub fn snapshot(&self) -> &Version {
        &self.snapshot
    }

    /// Buffer a put
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> &mut Self {
        self.writes.push(WriteOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    /// Buffer a removal
    pub fn remove(&mut self, key: impl Into<Bytes>) -> &mut Self {
        self.writes.push(WriteOp::Remove { key: key.into() });
        self
    }

    /// Track a key as read
    pub fn record_read(&mut self, key: impl Into<Bytes>) {
        self.reads.insert(key.into());
    }

    /// Remember which transaction wrote the value of `key` visible at the
    /// snapshot. The first observation of a key sticks.
    pub fn observe(&mut self, key: impl Into<Bytes>, writer: Option<GlobalTransactionId>) {
        self.observed.entry(key.into()).or_insert(writer);
    }

    /// Whether `key` was observed already
    pub fn has_observed(&self, key: &[u8]) -> bool {
        self.observed.contains_key(key)
    }

    /// Latest buffered write for `key`, if any. `Some(None)` means removed.
    pub fn buffered(&self, key: &[u8]) -> Option<Option<Bytes>> {
        self.writes
            .iter()
            .rev()
            .find(|op| op.key().as_ref() == key)
            .map(|op| match op {
                WriteOp::Put { value, .. } => Some(value.clone()),
                WriteOp::Remove { .. } => None,
            })
    }

    /// Buffered writes
    pub fn write_set(&self) -> &[WriteOp] {
        &self.writes
    }

    /// Keys read so far
    pub fn read_set(&self) -> &BTreeSet<Bytes> {
        &self.reads
    }

    /// No writes
    pub fn is_read_only(&self) -> bool {
        self.writes.is_empty()
    }

    /// Record the `(epoch, protocol)` this transaction commits under
    pub fn set_stamp(&mut self, stamp: EpochStamp) {
        self.stamp = Some(stamp);
    }

    /// Commit stamp, once assigned
    pub fn stamp(&self) -> Option<&EpochStamp> {
        self.stamp.as_ref()
    }

    /// Completion slot for asynchronous validation paths
    pub fn completion(&self) -> &Arc<TransactionCompletion> {
        &self.completion
    }

    /// Node-local record of this transaction. Requires a stamp.
    pub fn to_cache_transaction(&self) -> Result<Arc<CacheTransaction>> {
        let stamp = self
            .stamp
            .clone()
            .ok_or_else(|| Error::transaction(format!("{} has no epoch stamp", self.gtx)))?;
        let read_set = (!self.reads.is_empty()).then(|| self.reads.clone());
        Ok(CacheTransaction::with_observed(
            self.gtx,
            self.writes.clone(),
            read_set,
            self.snapshot.clone(),
            stamp,
            self.observed.clone(),
        ))
    }
}

impl fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("gtx", &self.gtx)
            .field("writes", &self.writes.len())
            .field("reads", &self.reads.len())
            .field("stamp", &self.stamp)
            .finish()
    }
}
