//! Total order validation
//!
//! Transactions delivered by the total order broadcast are validated here
//! before they reach the commit manager. Two strategies share one core:
//!
//! - [`SequentialTotalOrderManager`]: validates on the delivery thread, one
//!   transaction at a time, in delivery order.
//! - [`ParallelTotalOrderManager`]: validates on a worker pool; a
//!   transaction waits only for earlier transactions touching the same
//!   keys, tracked through per-key [`DependencyLatch`]es.
//!
//! ```text
//!   delivery --> register keys --> ConditionalScheduler --> validate
//!                    |                     ^                   |
//!                    +-- latch of previous-+      finish <-----+
//!                        owner of the key         (deregister, release)
//! ```

mod parallel;
mod remote;
mod scheduler;
mod sequential;
mod validator;

pub use parallel::ParallelTotalOrderManager;
pub use remote::{Precheck, RemotePhase, RemoteTransaction};
pub use scheduler::{ConditionalScheduler, SchedulerStats};
pub use sequential::SequentialTotalOrderManager;
pub use validator::{PrepareValidator, SnapshotValidator};

use crate::command::TxPayload;
use crate::config::ValidationStrategy;
use crate::latch::{DependencyLatch, LatchOutcome};
use crate::transaction::{
    CacheTransaction, CommitOutcome, GlobalTransactionId, ReplyHandle, TransactionCompletion,
    TxState,
};
use crate::version::{NodeId, Version};
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// Finished transactions remembered to drop late commit and rollback
/// commands
const FINISHED_HISTORY: usize = 4096;

/// Result of handing a command to the ordering layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Validated, committed and applied
    Applied,
    /// Validated and queued; waiting for the commit decision
    Prepared(Version),
    /// Accepted; the decision is taken on another thread
    Queued,
    /// Stamped for a protocol this node no longer routes to
    Retransmit,
    /// Refused
    Rejected(String),
}

/// A prepare delivered by the total order broadcast
#[derive(Debug, Clone)]
pub struct SequencedPrepare {
    /// Transaction body
    pub tx: TxPayload,
    /// Commit right after a successful prepare
    pub one_phase: bool,
    /// Delivering node
    pub from: NodeId,
}

/// Total order manager statistics
#[derive(Debug, Clone, Default)]
pub struct TotalOrderStats {
    /// Prepares delivered
    pub delivered: u64,
    /// Transactions validated successfully
    pub validated: u64,
    /// Transactions rejected by validation
    pub rejected: u64,
    /// Transactions discarded by an early rollback
    pub discarded: u64,
    /// Transactions whose commit arrived before validation started
    pub forced_commits: u64,
}

/// Bounded set of finished transaction ids, oldest evicted first
#[derive(Default)]
struct FinishedSet {
    ids: HashSet<GlobalTransactionId>,
    order: VecDeque<GlobalTransactionId>,
}

impl FinishedSet {
    fn record(&mut self, gtx: GlobalTransactionId) {
        if !self.ids.insert(gtx) {
            return;
        }
        self.order.push_back(gtx);
        if self.order.len() > FINISHED_HISTORY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, gtx: &GlobalTransactionId) -> bool {
        self.ids.contains(gtx)
    }
}

/// State shared by both strategies
pub struct TotalOrderCore {
    node: NodeId,
    validator: Arc<dyn PrepareValidator>,
    local: DashMap<GlobalTransactionId, Arc<TransactionCompletion>>,
    remote: DashMap<GlobalTransactionId, Arc<RemoteTransaction>>,
    /// Latch of the last transaction registered on each key
    keys: DashMap<Bytes, Arc<DependencyLatch>>,
    /// Guards creation of remote state against a concurrent finish
    finished: Mutex<FinishedSet>,
    stats: Mutex<TotalOrderStats>,
}

impl TotalOrderCore {
    /// Create the core for `node`
    pub fn new(node: NodeId, validator: Arc<dyn PrepareValidator>) -> Arc<Self> {
        Arc::new(Self {
            node,
            validator,
            local: DashMap::new(),
            remote: DashMap::new(),
            keys: DashMap::new(),
            finished: Mutex::new(FinishedSet::default()),
            stats: Mutex::new(TotalOrderStats::default()),
        })
    }

    /// Local node
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Validation steps
    pub fn validator(&self) -> &Arc<dyn PrepareValidator> {
        &self.validator
    }

    /// Register a local transaction awaiting its validation outcome
    pub fn add_local_transaction(&self, gtx: GlobalTransactionId, completion: Arc<TransactionCompletion>) {
        self.local.insert(gtx, completion);
    }

    /// Remote state of `gtx`, created on first sight. `None` once `gtx`
    /// finished: nothing is tracked for it any more.
    pub fn remote_transaction(&self, gtx: GlobalTransactionId) -> Option<Arc<RemoteTransaction>> {
        let finished = self.finished.lock();
        if finished.contains(&gtx) {
            return None;
        }
        let remote = self
            .remote
            .entry(gtx)
            .or_insert_with(|| Arc::new(RemoteTransaction::new(gtx)))
            .clone();
        Some(remote)
    }

    /// Whether `gtx` finished recently
    pub fn is_finished(&self, gtx: GlobalTransactionId) -> bool {
        self.finished.lock().contains(&gtx)
    }

    /// Attach the delivered body. `None` on duplicate delivery.
    pub(crate) fn accept(&self, prepare: &SequencedPrepare) -> Option<Arc<RemoteTransaction>> {
        self.stats.lock().delivered += 1;
        let Some(remote) = self.remote_transaction(prepare.tx.gtx) else {
            tracing::warn!(gtx = %prepare.tx.gtx, from = prepare.from, "delivery of a finished transaction");
            return None;
        };
        if !remote.set_transaction(prepare.tx.to_cache_transaction()) {
            tracing::warn!(gtx = %prepare.tx.gtx, from = prepare.from, "duplicate total order delivery");
            return None;
        }
        Some(remote)
    }

    /// Register `tx`'s write keys, returning the latches it must wait for.
    /// Read-set keys add a dependency on their current owner without
    /// taking ownership.
    pub(crate) fn register_dependencies(
        &self,
        tx: &CacheTransaction,
        include_reads: bool,
    ) -> Vec<Arc<DependencyLatch>> {
        let own = tx.latch();
        let mut dependencies: Vec<Arc<DependencyLatch>> = Vec::new();
        let mut push = |latch: Arc<DependencyLatch>| {
            if !latch.is_released()
                && !Arc::ptr_eq(&latch, own)
                && !dependencies.iter().any(|d| Arc::ptr_eq(d, &latch))
            {
                dependencies.push(latch);
            }
        };

        let write_keys = tx.write_keys();
        for key in &write_keys {
            if let Some(previous) = self.keys.insert(key.clone(), own.clone()) {
                push(previous);
            }
        }

        if include_reads {
            if let Some(reads) = tx.read_set() {
                for key in reads.iter().filter(|k| !write_keys.contains(*k)) {
                    let owner = self.keys.get(key).map(|latch| latch.value().clone());
                    if let Some(owner) = owner {
                        push(owner);
                    }
                }
            }
        }
        dependencies
    }

    /// Run validation for a delivered transaction. In blocking mode the
    /// calling thread waits for the applier; otherwise completion is
    /// driven by a reply handle fired from the applier thread.
    pub(crate) fn validate(
        self: &Arc<Self>,
        remote: &Arc<RemoteTransaction>,
        one_phase: bool,
        blocking: bool,
    ) -> Outcome {
        let gtx = remote.gtx();
        let Some(tx) = remote.transaction() else {
            return Outcome::Rejected(format!("{} has no delivered body", gtx));
        };

        let (skip_write_skew, one_phase, forced_version) = match remote.begin_validation() {
            Precheck::Proceed => (false, one_phase, None),
            Precheck::Rollback => {
                tracing::debug!(%gtx, "discarded before validation");
                self.stats.lock().discarded += 1;
                if let Err(e) = tx.transition(TxState::RolledBack) {
                    tracing::warn!(%gtx, error = %e, "discard of a finished transaction");
                }
                self.finish_quietly(gtx, &tx);
                return Outcome::Rejected(format!("{} rolled back before validation", gtx));
            }
            Precheck::Commit(version) => {
                self.stats.lock().forced_commits += 1;
                (true, true, version)
            }
        };

        let prepared = match self.validator.prepare(&tx, skip_write_skew) {
            Ok(version) => version,
            Err(e) => return self.reject(remote, &tx, e),
        };
        remote.prepared();
        self.stats.lock().validated += 1;

        if !one_phase {
            return Outcome::Prepared(prepared);
        }

        let final_version = forced_version.unwrap_or(prepared);
        if let Err(e) = self.validator.commit(&tx, &final_version) {
            return self.reject(remote, &tx, e);
        }
        self.await_and_finish(&tx, blocking)
    }

    /// Commit a prepared remote transaction at `version`
    pub(crate) fn commit_prepared(
        self: &Arc<Self>,
        tx: &Arc<CacheTransaction>,
        version: &Version,
        blocking: bool,
    ) -> Result<Outcome> {
        self.validator.commit(tx, version)?;
        Ok(self.await_and_finish(tx, blocking))
    }

    /// Roll back a prepared remote transaction
    pub(crate) fn rollback_prepared(&self, tx: &Arc<CacheTransaction>) -> Result<()> {
        let result = self.validator.rollback(tx);
        if tx.state() != TxState::RolledBack {
            if let Err(e) = tx.transition(TxState::RolledBack) {
                tracing::warn!(gtx = %tx.gtx(), error = %e, "rollback of a finished transaction");
            }
        }
        self.finish_quietly(tx.gtx(), tx);
        result
    }

    fn await_and_finish(self: &Arc<Self>, tx: &Arc<CacheTransaction>, blocking: bool) -> Outcome {
        let gtx = tx.gtx();
        if blocking {
            let result = self.validator.await_applied(tx, None);
            self.finish_quietly(gtx, tx);
            return match result {
                Ok(()) => Outcome::Applied,
                Err(e) => Outcome::Rejected(e.to_string()),
            };
        }

        let core = self.clone();
        let owned = tx.clone();
        let reply = ReplyHandle::new(move |outcome| {
            if outcome != CommitOutcome::Committed {
                tracing::debug!(%gtx, ?outcome, "transaction left the queue uncommitted");
            }
            core.finish_quietly(gtx, &owned);
        });
        match self.validator.await_applied(tx, Some(reply)) {
            Ok(()) => Outcome::Queued,
            Err(e) => {
                self.finish_quietly(gtx, tx);
                Outcome::Rejected(e.to_string())
            }
        }
    }

    /// Fail `remote` after its validation panicked: undo a queued prepare,
    /// release the latch and complete the local waiter with an error
    pub(crate) fn abandon(&self, remote: &RemoteTransaction) {
        let gtx = remote.gtx();
        let Some(tx) = remote.transaction() else {
            return;
        };
        tracing::error!(%gtx, state = ?tx.state(), "abandoning transaction after a validation panic");
        if tx.state() == TxState::Prepared {
            if let Err(e) = self.validator.rollback(&tx) {
                tracing::warn!(%gtx, error = %e, "rollback after a validation panic");
            }
        }
        if tx.state() != TxState::Committed {
            remote.failed(Error::internal(format!("validation of {} panicked", gtx)));
        }
        self.stats.lock().rejected += 1;
        self.finish_quietly(gtx, &tx);
    }

    fn reject(&self, remote: &RemoteTransaction, tx: &Arc<CacheTransaction>, error: Error) -> Outcome {
        tracing::debug!(gtx = %tx.gtx(), error = %error, "validation failed");
        self.stats.lock().rejected += 1;
        if tx.state() != TxState::Preparing {
            if let Err(e) = self.validator.rollback(tx) {
                tracing::warn!(gtx = %tx.gtx(), error = %e, "rollback after failed validation");
            }
        }
        remote.failed(error.clone());
        self.finish_quietly(tx.gtx(), tx);
        Outcome::Rejected(error.to_string())
    }

    fn finish_quietly(&self, gtx: GlobalTransactionId, tx: &Arc<CacheTransaction>) {
        if let Err(e) = self.finish(gtx, true, Some(tx)) {
            tracing::warn!(%gtx, error = %e, "finish failed");
        }
    }

    /// Deregister keys, release the latch and complete the local waiter
    pub fn finish(
        &self,
        gtx: GlobalTransactionId,
        ignore_if_missing: bool,
        tx: Option<&Arc<CacheTransaction>>,
    ) -> Result<()> {
        let remote = {
            let mut finished = self.finished.lock();
            finished.record(gtx);
            self.remote.remove(&gtx).map(|(_, remote)| remote)
        };
        let tx = tx
            .cloned()
            .or_else(|| remote.as_ref().and_then(|r| r.transaction()));
        let Some(tx) = tx else {
            if ignore_if_missing {
                return Ok(());
            }
            return Err(Error::transaction(format!("{} is not tracked", gtx)));
        };

        for key in tx.write_keys() {
            self.keys
                .remove_if(&key, |_, latch| Arc::ptr_eq(latch, tx.latch()));
        }

        let outcome = tx.latch_outcome();
        tx.latch().release(outcome);

        if let Some((_, completion)) = self.local.remove(&gtx) {
            let result = match outcome {
                LatchOutcome::Committed => Ok(()),
                LatchOutcome::RolledBack | LatchOutcome::Failed => {
                    Err(remote.and_then(|r| r.failure()).unwrap_or_else(|| {
                        Error::aborted(format!("{} finished as {:?}", gtx, outcome))
                    }))
                }
            };
            completion.complete(result);
        }
        Ok(())
    }

    /// Keys with a registered owner
    pub fn registered_keys(&self) -> usize {
        self.keys.len()
    }

    /// Remote transactions being tracked
    pub fn tracked_transactions(&self) -> usize {
        self.remote.len()
    }

    /// Current statistics
    pub fn stats(&self) -> TotalOrderStats {
        self.stats.lock().clone()
    }
}

/// Validation of transactions delivered in total order
pub trait TotalOrderManager: Send + Sync {
    /// Shared state
    fn core(&self) -> &Arc<TotalOrderCore>;

    /// Strategy implemented
    fn strategy(&self) -> ValidationStrategy;

    /// Entry point for each prepare, called in delivery order
    fn process_transaction_from_sequencer(&self, prepare: SequencedPrepare) -> Result<Outcome>;

    /// Whether remote completion runs asynchronously
    fn is_asynchronous(&self) -> bool {
        false
    }

    /// Register a local transaction so its outcome reaches the waiting
    /// thread
    fn add_local_transaction(&self, gtx: GlobalTransactionId, completion: Arc<TransactionCompletion>) {
        self.core().add_local_transaction(gtx, completion);
    }

    /// Release the latch of `gtx` and forget it
    fn finish_transaction(
        &self,
        gtx: GlobalTransactionId,
        ignore_if_missing: bool,
        tx: Option<&Arc<CacheTransaction>>,
    ) -> Result<()> {
        self.core().finish(gtx, ignore_if_missing, tx)
    }

    /// Reconcile an out-of-order commit or rollback with validation.
    /// Returns whether the caller must still process the command.
    fn wait_for_tx_prepared(
        &self,
        remote: &Arc<RemoteTransaction>,
        is_commit: bool,
        version: Option<&Version>,
    ) -> bool {
        remote.wait_for_prepared(is_commit, version)
    }

    /// Whether this node originated `gtx`
    fn is_coordinated_locally(&self, gtx: GlobalTransactionId) -> bool {
        gtx.origin == self.core().node()
    }

    /// Handle a commit for a two-phase total order transaction
    fn process_commit(&self, gtx: GlobalTransactionId, version: &Version) -> Result<Outcome> {
        let core = self.core();
        let Some(remote) = core.remote_transaction(gtx) else {
            tracing::debug!(%gtx, "late commit dropped");
            return Ok(Outcome::Rejected(format!("{} already finished", gtx)));
        };
        if !self.wait_for_tx_prepared(&remote, true, Some(version)) {
            return Ok(Outcome::Queued);
        }
        let tx = remote
            .transaction()
            .ok_or_else(|| Error::internal(format!("{} prepared without a body", gtx)))?;
        core.commit_prepared(&tx, version, !self.is_asynchronous())
    }

    /// Handle a rollback for a total order transaction
    fn process_rollback(&self, gtx: GlobalTransactionId) -> Result<Outcome> {
        let core = self.core();
        let Some(remote) = core.remote_transaction(gtx) else {
            tracing::debug!(%gtx, "late rollback dropped");
            return Ok(Outcome::Rejected(format!("{} already finished", gtx)));
        };
        if !self.wait_for_tx_prepared(&remote, false, None) {
            return Ok(Outcome::Queued);
        }
        let tx = remote
            .transaction()
            .ok_or_else(|| Error::internal(format!("{} prepared without a body", gtx)))?;
        core.rollback_prepared(&tx)?;
        Ok(Outcome::Rejected(format!("{} rolled back", gtx)))
    }

    /// Stop worker resources
    fn shutdown(&self) {}
}

/// Build the manager selected by `strategy`
pub fn build_total_order_manager(
    strategy: ValidationStrategy,
    node: NodeId,
    validator: Arc<dyn PrepareValidator>,
    workers: usize,
    read_set_dependencies: bool,
) -> Result<Arc<dyn TotalOrderManager>> {
    let core = TotalOrderCore::new(node, validator);
    Ok(match strategy {
        ValidationStrategy::Sequential => Arc::new(SequentialTotalOrderManager::new(core)),
        ValidationStrategy::Parallel => Arc::new(ParallelTotalOrderManager::new(
            core,
            workers,
            read_set_dependencies,
        )?),
    })
}
