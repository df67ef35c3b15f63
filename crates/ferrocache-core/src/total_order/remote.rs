//! Per-transaction state of remote validation
//!
//! Commit and rollback commands may arrive before the prepare of the same
//! transaction finished (or even started) validating. The markers recorded
//! here are consumed by the validator's pre-checks.

use crate::Error;
use crate::transaction::{CacheTransaction, GlobalTransactionId};
use crate::version::Version;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;

/// Validation phase of a remote transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePhase {
    /// Known, validation not started
    Received,
    /// Being validated
    Validating,
    /// Validated and queued
    Prepared,
    /// Rejected or discarded
    Failed,
}

/// Decision taken when validation starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precheck {
    /// Validate normally
    Proceed,
    /// A rollback arrived first: discard without validating
    Rollback,
    /// A commit arrived first: skip write-skew checks and commit in one
    /// phase, at the given version when one was sent
    Commit(Option<Version>),
}

struct RemoteState {
    phase: RemotePhase,
    marked_rollback: bool,
    marked_commit: Option<Option<Version>>,
    failure: Option<Error>,
}

/// Remote transaction tracked by a total order manager
pub struct RemoteTransaction {
    gtx: GlobalTransactionId,
    tx: Mutex<Option<Arc<CacheTransaction>>>,
    state: Mutex<RemoteState>,
    settled: Condvar,
}

impl RemoteTransaction {
    /// Track `gtx`
    pub fn new(gtx: GlobalTransactionId) -> Self {
        Self {
            gtx,
            tx: Mutex::new(None),
            state: Mutex::new(RemoteState {
                phase: RemotePhase::Received,
                marked_rollback: false,
                marked_commit: None,
                failure: None,
            }),
            settled: Condvar::new(),
        }
    }

    /// Transaction id
    pub fn gtx(&self) -> GlobalTransactionId {
        self.gtx
    }

    /// Local record, once the prepare was delivered
    pub fn transaction(&self) -> Option<Arc<CacheTransaction>> {
        self.tx.lock().clone()
    }

    /// Attach the local record. Returns false on a duplicate delivery.
    pub fn set_transaction(&self, tx: Arc<CacheTransaction>) -> bool {
        let mut slot = self.tx.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(tx);
        true
    }

    /// Current phase
    pub fn phase(&self) -> RemotePhase {
        self.state.lock().phase
    }

    /// Validation error, if validation failed
    pub fn failure(&self) -> Option<Error> {
        self.state.lock().failure.clone()
    }

    /// Enter `Validating`, consuming the out-of-order markers
    pub fn begin_validation(&self) -> Precheck {
        let mut state = self.state.lock();
        if state.marked_rollback {
            state.phase = RemotePhase::Failed;
            state.failure = Some(Error::aborted(format!("{} rolled back before validation", self.gtx)));
            self.settled.notify_all();
            return Precheck::Rollback;
        }
        state.phase = RemotePhase::Validating;
        match state.marked_commit.take() {
            Some(version) => Precheck::Commit(version),
            None => Precheck::Proceed,
        }
    }

    /// Validation succeeded
    pub fn prepared(&self) {
        self.settle(RemotePhase::Prepared, None);
    }

    /// Validation failed with `error`
    pub fn failed(&self, error: Error) {
        self.settle(RemotePhase::Failed, Some(error));
    }

    fn settle(&self, phase: RemotePhase, failure: Option<Error>) {
        let mut state = self.state.lock();
        state.phase = phase;
        if failure.is_some() {
            state.failure = failure;
        }
        self.settled.notify_all();
    }

    /// Reconcile a commit (`is_commit`) or rollback with validation.
    /// Returns whether the caller must still process the command itself;
    /// false means validation will take care of it, or already rejected
    /// the transaction.
    pub fn wait_for_prepared(&self, is_commit: bool, version: Option<&Version>) -> bool {
        let mut state = self.state.lock();
        loop {
            match state.phase {
                RemotePhase::Received => {
                    if is_commit {
                        state.marked_commit = Some(version.cloned());
                    } else {
                        state.marked_rollback = true;
                    }
                    return false;
                }
                RemotePhase::Validating => self.settled.wait(&mut state),
                RemotePhase::Prepared => return true,
                RemotePhase::Failed => return false,
            }
        }
    }
}

impl fmt::Debug for RemoteTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTransaction")
            .field("gtx", &self.gtx)
            .field("phase", &self.phase())
            .finish()
    }
}
