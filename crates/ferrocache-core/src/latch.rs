//! Dependency latches
//!
//! A latch fires exactly once, when its transaction reaches a terminal
//! state. Conflicting transactions either block on it or register a
//! callback that the releasing thread runs.

use crate::transaction::GlobalTransactionId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::time::Duration;

/// Terminal outcome carried by a released latch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchOutcome {
    /// The owner committed
    Committed,
    /// The owner was rolled back
    RolledBack,
    /// Validation failed
    Failed,
}

type Listener = Box<dyn FnOnce(LatchOutcome) + Send>;

struct LatchState {
    outcome: Option<LatchOutcome>,
    listeners: Vec<Listener>,
}

/// Single-fire synchronization token owned by one transaction
pub struct DependencyLatch {
    owner: GlobalTransactionId,
    state: Mutex<LatchState>,
    released: Condvar,
}

impl DependencyLatch {
    /// Create an unreleased latch
    pub fn new(owner: GlobalTransactionId) -> Self {
        Self {
            owner,
            state: Mutex::new(LatchState {
                outcome: None,
                listeners: Vec::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Transaction owning this latch
    pub fn owner(&self) -> GlobalTransactionId {
        self.owner
    }

    /// Fire the latch. Only the first call has an effect; returns whether
    /// this call released it. Listeners run on the calling thread after the
    /// internal lock is dropped.
    pub fn release(&self, outcome: LatchOutcome) -> bool {
        let listeners = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                tracing::warn!(owner = %self.owner, "dependency latch released twice");
                return false;
            }
            state.outcome = Some(outcome);
            self.released.notify_all();
            std::mem::take(&mut state.listeners)
        };

        tracing::trace!(owner = %self.owner, ?outcome, waiters = listeners.len(), "latch released");
        for listener in listeners {
            listener(outcome);
        }
        true
    }

    /// Outcome, if released
    pub fn outcome(&self) -> Option<LatchOutcome> {
        self.state.lock().outcome
    }

    /// Whether the latch fired
    pub fn is_released(&self) -> bool {
        self.outcome().is_some()
    }

    /// Run `listener` on release. Runs immediately on this thread when the
    /// latch already fired.
    pub fn on_release(&self, listener: impl FnOnce(LatchOutcome) + Send + 'static) {
        let mut state = self.state.lock();
        let outcome = state.outcome;
        if let Some(outcome) = outcome {
            drop(state);
            listener(outcome);
            return;
        }
        state.listeners.push(Box::new(listener));
    }

    /// Block until released
    pub fn wait(&self) -> LatchOutcome {
        let mut state = self.state.lock();
        loop {
            if let Some(outcome) = state.outcome {
                return outcome;
            }
            self.released.wait(&mut state);
        }
    }

    /// Block until released or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> Option<LatchOutcome> {
        let mut state = self.state.lock();
        if state.outcome.is_none() {
            let _ = self
                .released
                .wait_while_for(&mut state, |s| s.outcome.is_none(), timeout);
        }
        state.outcome
    }
}

impl fmt::Debug for DependencyLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyLatch")
            .field("owner", &self.owner)
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn latch() -> Arc<DependencyLatch> {
        Arc::new(DependencyLatch::new(GlobalTransactionId::new(0, 1)))
    }

    #[test]
    fn test_release_once() {
        let latch = latch();
        assert!(latch.release(LatchOutcome::RolledBack));
        assert!(!latch.release(LatchOutcome::Committed));
        assert_eq!(latch.outcome(), Some(LatchOutcome::RolledBack));
    }

    #[test]
    fn test_listeners_fire_once() {
        let latch = latch();
        let fired = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let fired = fired.clone();
            latch.on_release(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        latch.release(LatchOutcome::Committed);
        latch.release(LatchOutcome::Committed);
        assert_eq!(fired.load(Ordering::SeqCst), 3);

        // Late registration runs immediately
        let late = fired.clone();
        latch.on_release(move |outcome| {
            assert_eq!(outcome, LatchOutcome::Committed);
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_wait_unblocks_on_release() {
        let latch = latch();
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(20));
        latch.release(LatchOutcome::Failed);
        assert_eq!(waiter.join().unwrap(), LatchOutcome::Failed);
    }

    #[test]
    fn test_wait_timeout() {
        let latch = latch();
        assert_eq!(latch.wait_timeout(Duration::from_millis(10)), None);
    }
}
