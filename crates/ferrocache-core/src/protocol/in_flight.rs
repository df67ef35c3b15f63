//! Local transactions in flight under one protocol
//!
//! A protocol admits a local commit through [`InFlightTransactions::begin`]
//! and the returned guard leaves the set on drop. Stopping or switching
//! the protocol closes admission, optionally aborts what has not reached
//! its commit point yet, and waits for the rest to drain.

use crate::transaction::GlobalTransactionId;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

const ACTIVE: u8 = 0;
const ABORTED: u8 = 1;
const COMMITTING: u8 = 2;

struct InFlightState {
    admitting: bool,
    active: HashMap<GlobalTransactionId, Arc<AtomicU8>>,
}

/// Set of local transactions committing under one protocol
pub struct InFlightTransactions {
    protocol: String,
    state: Mutex<InFlightState>,
    drained: Condvar,
}

impl InFlightTransactions {
    /// Empty set, not admitting until [`resume`](Self::resume)
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            state: Mutex::new(InFlightState {
                admitting: false,
                active: HashMap::new(),
            }),
            drained: Condvar::new(),
        }
    }

    /// Admit `gtx`. Fails with `SwitchInProgress` while admission is closed.
    pub fn begin(&self, gtx: GlobalTransactionId) -> Result<InFlightGuard<'_>> {
        let mut state = self.state.lock();
        if !state.admitting {
            return Err(Error::SwitchInProgress);
        }
        let flag = Arc::new(AtomicU8::new(ACTIVE));
        if state.active.insert(gtx, flag.clone()).is_some() {
            tracing::warn!(%gtx, protocol = %self.protocol, "transaction admitted twice");
        }
        Ok(InFlightGuard {
            owner: self,
            gtx,
            flag,
        })
    }

    /// Open admission
    pub fn resume(&self) {
        self.state.lock().admitting = true;
    }

    /// Close admission; running transactions go on
    pub fn stop_admitting(&self) {
        self.state.lock().admitting = false;
    }

    /// Whether new transactions are admitted
    pub fn is_admitting(&self) -> bool {
        self.state.lock().admitting
    }

    /// Abort every transaction that has not reached its commit point.
    /// Returns how many were aborted.
    pub fn abort_all(&self) -> u64 {
        let state = self.state.lock();
        let aborted = state
            .active
            .values()
            .filter(|flag| {
                flag.compare_exchange(ACTIVE, ABORTED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            })
            .count() as u64;
        if aborted > 0 {
            tracing::info!(protocol = %self.protocol, aborted, "aborting in-flight transactions");
        }
        aborted
    }

    /// Wait until no transaction is in flight. Returns false on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.active.is_empty() {
            let _ = self
                .drained
                .wait_while_for(&mut state, |s| !s.active.is_empty(), timeout);
        }
        state.active.is_empty()
    }

    /// Transactions in flight
    pub fn len(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Nothing in flight
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn leave(&self, gtx: GlobalTransactionId) {
        let mut state = self.state.lock();
        state.active.remove(&gtx);
        if state.active.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// Membership of one transaction in an [`InFlightTransactions`] set
pub struct InFlightGuard<'a> {
    owner: &'a InFlightTransactions,
    gtx: GlobalTransactionId,
    flag: Arc<AtomicU8>,
}

impl InFlightGuard<'_> {
    /// Fail if the transaction was aborted by a protocol stop
    pub fn check_aborted(&self) -> Result<()> {
        if self.flag.load(Ordering::Acquire) == ABORTED {
            return Err(self.aborted_error());
        }
        Ok(())
    }

    /// Cross the commit point: from here on the transaction can no longer
    /// be aborted by a protocol stop
    pub fn enter_commit(&self) -> Result<()> {
        match self
            .flag
            .compare_exchange(ACTIVE, COMMITTING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(()),
            Err(COMMITTING) => Ok(()),
            Err(_) => Err(self.aborted_error()),
        }
    }

    fn aborted_error(&self) -> Error {
        Error::aborted(format!(
            "{} aborted by stop of protocol {}",
            self.gtx, self.owner.protocol
        ))
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.owner.leave(self.gtx);
    }
}
