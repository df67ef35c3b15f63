//! Transaction commit manager
//!
//! Assigns provisional versions at prepare time, final versions at commit
//! time, and owns the commit applier: a dedicated thread that drains the
//! ready prefix of the [`SortedTransactionQueue`] and applies it to storage
//! strictly in version order.

use crate::commit_log::{CommitLog, CommittedTransactionRecord};
use crate::queue::{SortedTransactionQueue, TransactionEntry};
use crate::storage::DataContainer;
use crate::transaction::{CacheTransaction, CommitOutcome, ReplyHandle, TxState};
use crate::version::{NodeId, Version, VersionGenerator};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Commit manager statistics
#[derive(Debug, Clone, Default)]
pub struct CommitManagerStats {
    /// Transactions prepared
    pub prepared: u64,
    /// Commits requested (final version assigned)
    pub committed: u64,
    /// Commits with no queue entry on this node
    pub read_only_commits: u64,
    /// Transactions rolled back
    pub rolled_back: u64,
    /// Write sets applied to storage
    pub applied: u64,
    /// Write sets whose apply failed
    pub apply_failures: u64,
    /// Transactions handed over below the applied watermark
    pub ordering_violations: u64,
    /// Applier batches published to the commit log
    pub batches: u64,
}

struct Applier {
    node: NodeId,
    queue: Arc<SortedTransactionQueue>,
    commit_log: Arc<CommitLog>,
    container: Arc<dyn DataContainer>,
    generator: Arc<dyn VersionGenerator>,
    stats: Arc<Mutex<CommitManagerStats>>,
}

impl Applier {
    fn run(self) {
        tracing::debug!(node = self.node, "commit applier started");
        let mut batch: Vec<Arc<TransactionEntry>> = Vec::new();
        let mut records = Vec::new();
        let mut highest_applied = 0u64;

        loop {
            batch.clear();
            records.clear();
            if let Err(e) = self.queue.populate_to_commit(&mut batch) {
                tracing::info!(node = self.node, reason = %e, "commit applier stopping");
                break;
            }

            for (sub_version, entry) in batch.iter().enumerate() {
                let tx = entry.transaction();
                let version = tx.version();
                let order = version.get(self.node);
                let write_version = self
                    .generator
                    .convert_version_to_write(&version, sub_version as u32);

                if order < highest_applied {
                    let err = Error::ordering(format!(
                        "{} at {} below applied watermark {}",
                        tx.gtx(),
                        order,
                        highest_applied
                    ));
                    tracing::error!(gtx = %tx.gtx(), %version, error = %err, "skipping transaction");
                    self.stats.lock().ordering_violations += 1;
                } else {
                    highest_applied = order;
                    match self.container.apply(tx.gtx(), tx.write_set(), &write_version) {
                        Ok(()) => {
                            self.container.notify_committed(&write_version);
                            self.stats.lock().applied += 1;
                        }
                        Err(e) => {
                            tracing::error!(
                                gtx = %tx.gtx(),
                                %version,
                                sub_version,
                                error = %e,
                                "failed to apply committed transaction"
                            );
                            self.stats.lock().apply_failures += 1;
                        }
                    }
                }

                records.push(CommittedTransactionRecord::new(
                    tx.gtx(),
                    version,
                    sub_version as u32,
                    tx.write_set().to_vec(),
                ));
            }

            self.commit_log.insert_new_committed_versions(&records);
            self.stats.lock().batches += 1;

            for entry in &batch {
                if let Err(e) = entry.transaction().transition(TxState::Committed) {
                    tracing::warn!(gtx = %entry.gtx(), error = %e, "applied transaction in unexpected state");
                }
                entry.committed();
            }
            tracing::trace!(node = self.node, size = batch.len(), "commit batch published");
        }
    }
}

/// Per-node commit manager
pub struct TransactionCommitManager {
    node: NodeId,
    queue: Arc<SortedTransactionQueue>,
    commit_log: Arc<CommitLog>,
    container: Arc<dyn DataContainer>,
    generator: Arc<dyn VersionGenerator>,
    /// Highest local counter handed out or finalized
    last_prepared: Mutex<u64>,
    stats: Arc<Mutex<CommitManagerStats>>,
    applier: Mutex<Option<JoinHandle<()>>>,
}

impl TransactionCommitManager {
    /// Create a stopped commit manager
    pub fn new(
        commit_log: Arc<CommitLog>,
        container: Arc<dyn DataContainer>,
        generator: Arc<dyn VersionGenerator>,
    ) -> Self {
        let node = generator.local_node();
        Self {
            node,
            queue: Arc::new(SortedTransactionQueue::new(node)),
            commit_log,
            container,
            generator,
            last_prepared: Mutex::new(0),
            stats: Arc::new(Mutex::new(CommitManagerStats::default())),
            applier: Mutex::new(None),
        }
    }

    /// Spawn the commit applier thread
    pub fn start(&self) -> Result<()> {
        let mut applier = self.applier.lock();
        if applier.is_some() {
            return Ok(());
        }
        if self.queue.is_closed() {
            return Err(Error::interrupted("commit manager already shut down"));
        }

        let worker = Applier {
            node: self.node,
            queue: self.queue.clone(),
            commit_log: self.commit_log.clone(),
            container: self.container.clone(),
            generator: self.generator.clone(),
            stats: self.stats.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("commit-applier-{}", self.node))
            .spawn(move || worker.run())
            .map_err(|e| Error::internal(format!("failed to spawn commit applier: {}", e)))?;
        *applier = Some(handle);
        Ok(())
    }

    /// Assign a provisional version and queue `tx`
    pub fn prepare_transaction(&self, tx: &Arc<CacheTransaction>) -> Result<Version> {
        let mut last_prepared = self.last_prepared.lock();
        if self.queue.get_transaction_entry(tx.gtx()).is_some() {
            tracing::warn!(gtx = %tx.gtx(), "transaction already prepared");
            return Ok(tx.version());
        }

        let base = self.commit_log.current_version();
        let node_seq = (*last_prepared).max(base.get(self.node)) + 1;
        let version = self.generator.set_node_version(&base, node_seq);

        tx.transition(TxState::Prepared)?;
        tx.set_version(version.clone());
        if !self.queue.prepare(tx.clone()) {
            return Err(Error::interrupted("commit queue closed"));
        }
        *last_prepared = node_seq;
        drop(last_prepared);

        self.stats.lock().prepared += 1;
        tracing::debug!(gtx = %tx.gtx(), %version, "transaction prepared");
        Ok(version)
    }

    /// Finalize `tx` at `final_version`. Transactions without a queue entry
    /// here only advance visibility.
    pub fn commit_transaction(&self, tx: &CacheTransaction, final_version: &Version) -> Result<()> {
        {
            let mut last_prepared = self.last_prepared.lock();
            *last_prepared = (*last_prepared).max(final_version.get(self.node));
        }

        tx.transition(TxState::Committing)?;
        if self.queue.commit(tx, final_version)? {
            self.stats.lock().committed += 1;
            tracing::debug!(gtx = %tx.gtx(), version = %final_version, "transaction committing");
            return Ok(());
        }

        tx.set_version(final_version.clone());
        self.commit_log.update_most_recent_version(final_version);
        tx.transition(TxState::Committed)?;
        let mut stats = self.stats.lock();
        stats.committed += 1;
        stats.read_only_commits += 1;
        tracing::debug!(gtx = %tx.gtx(), version = %final_version, "committed without local footprint");
        Ok(())
    }

    /// Remove `tx` from the queue. Returns false when it had no entry or
    /// the applier already took it.
    pub fn rollback_transaction(&self, tx: &CacheTransaction) -> Result<bool> {
        if tx.state() == TxState::Committed {
            return Err(Error::transaction(format!("{} already committed", tx.gtx())));
        }

        let removed = self.queue.rollback(tx.gtx());
        if !removed && self.queue.get_transaction_entry(tx.gtx()).is_some() {
            return Ok(false);
        }
        tx.transition(TxState::RolledBack)?;
        if removed {
            self.stats.lock().rolled_back += 1;
            tracing::debug!(gtx = %tx.gtx(), "transaction rolled back");
        }
        Ok(removed)
    }

    /// Wait for `tx` to be applied. With a reply handle the call returns at
    /// once and the handle fires later; without one the calling thread
    /// blocks.
    pub fn await_until_committed(
        &self,
        tx: &CacheTransaction,
        reply: Option<ReplyHandle>,
    ) -> Result<()> {
        let Some(entry) = self.queue.get_transaction_entry(tx.gtx()) else {
            let outcome = match tx.state() {
                TxState::RolledBack => CommitOutcome::RolledBack,
                _ => CommitOutcome::Committed,
            };
            return match reply {
                Some(reply) => {
                    reply.send(outcome);
                    Ok(())
                }
                None => outcome_to_result(tx, outcome),
            };
        };

        match reply {
            Some(reply) => {
                entry.on_committed(reply);
                Ok(())
            }
            None => outcome_to_result(tx, entry.wait()),
        }
    }

    /// Close the queue and join the applier
    pub fn shutdown(&self) {
        self.queue.close();
        if let Some(handle) = self.applier.lock().take() {
            if handle.join().is_err() {
                tracing::error!(node = self.node, "commit applier panicked");
            }
        }
    }

    /// Local node
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Queue of pending transactions
    pub fn queue(&self) -> &Arc<SortedTransactionQueue> {
        &self.queue
    }

    /// Commit log
    pub fn commit_log(&self) -> &Arc<CommitLog> {
        &self.commit_log
    }

    /// Storage container
    pub fn container(&self) -> &Arc<dyn DataContainer> {
        &self.container
    }

    /// Version generator
    pub fn generator(&self) -> &Arc<dyn VersionGenerator> {
        &self.generator
    }

    /// Current statistics
    pub fn stats(&self) -> CommitManagerStats {
        self.stats.lock().clone()
    }
}

fn outcome_to_result(tx: &CacheTransaction, outcome: CommitOutcome) -> Result<()> {
    match outcome {
        CommitOutcome::Committed => Ok(()),
        CommitOutcome::RolledBack => Err(Error::aborted(format!("{} rolled back", tx.gtx()))),
        CommitOutcome::Abandoned => Err(Error::interrupted(format!(
            "{} abandoned at shutdown",
            tx.gtx()
        ))),
    }
}

impl Drop for TransactionCommitManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
