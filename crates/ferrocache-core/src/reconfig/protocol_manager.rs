//! Active protocol, epoch and switch status
//!
//! ```text
//!   SAFE --reserve--> IN_PROGRESS --change--------------> SAFE (epoch+1)
//!                          |
//!                          +--begin_unsafe--> UNSAFE --safe--> SAFE
//!                                           (epoch+1)
//! ```
//!
//! `old` is only set while the status is `IN_PROGRESS` or `UNSAFE`.

use crate::protocol::ReplicationProtocol;
use crate::transaction::EpochStamp;
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Switch status of the protocol manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SwitchStatus {
    /// One protocol, no switch running
    Safe,
    /// Non-blocking switch draining the previous protocol
    Unsafe,
    /// Switch being set up, or a stop-the-world switch running
    InProgress,
}

/// Consistent snapshot of the manager state
#[derive(Clone)]
pub struct ProtocolView {
    /// Active protocol
    pub current: Arc<dyn ReplicationProtocol>,
    /// Protocol being replaced, while a switch runs
    pub old: Option<Arc<dyn ReplicationProtocol>>,
    /// Protocol generation
    pub epoch: u64,
    /// Switch status
    pub status: SwitchStatus,
}

impl ProtocolView {
    /// Stamp for a transaction admitted now
    pub fn stamp(&self) -> EpochStamp {
        EpochStamp::new(self.epoch, self.current.id())
    }
}

impl fmt::Debug for ProtocolView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolView")
            .field("current", &self.current.id())
            .field("old", &self.old.as_ref().map(|p| p.id().to_string()))
            .field("epoch", &self.epoch)
            .field("status", &self.status)
            .finish()
    }
}

struct ManagerState {
    view: ProtocolView,
    closed: bool,
}

/// Holder of the current protocol and epoch
pub struct ProtocolManager {
    state: Mutex<ManagerState>,
    changed: Condvar,
}

impl ProtocolManager {
    /// Start SAFE at epoch 0 with `initial`
    pub fn new(initial: Arc<dyn ReplicationProtocol>) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                view: ProtocolView {
                    current: initial,
                    old: None,
                    epoch: 0,
                    status: SwitchStatus::Safe,
                },
                closed: false,
            }),
            changed: Condvar::new(),
        }
    }

    /// Current state
    pub fn view(&self) -> ProtocolView {
        self.state.lock().view.clone()
    }

    /// Active protocol
    pub fn current(&self) -> Arc<dyn ReplicationProtocol> {
        self.state.lock().view.current.clone()
    }

    /// Protocol being replaced
    pub fn old(&self) -> Option<Arc<dyn ReplicationProtocol>> {
        self.state.lock().view.old.clone()
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.state.lock().view.epoch
    }

    /// Switch status
    pub fn status(&self) -> SwitchStatus {
        self.state.lock().view.status
    }

    /// Whether a switch is running
    pub fn in_progress(&self) -> bool {
        self.status() != SwitchStatus::Safe
    }

    /// SAFE -> IN_PROGRESS
    pub fn reserve(&self) -> Result<ProtocolView> {
        let mut state = self.state.lock();
        if state.view.status != SwitchStatus::Safe {
            return Err(Error::SwitchInProgress);
        }
        state.view.old = Some(state.view.current.clone());
        state.view.status = SwitchStatus::InProgress;
        self.changed.notify_all();
        Ok(state.view.clone())
    }

    /// IN_PROGRESS -> UNSAFE with `next` current and the epoch advanced
    pub fn begin_unsafe(&self, next: Arc<dyn ReplicationProtocol>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.view.status != SwitchStatus::InProgress {
            return Err(Error::internal(format!(
                "unsafe window opened from {:?}",
                state.view.status
            )));
        }
        state.view.current = next;
        state.view.epoch += 1;
        state.view.status = SwitchStatus::Unsafe;
        self.changed.notify_all();
        Ok(state.view.epoch)
    }

    /// UNSAFE -> SAFE once the previous protocol drained
    pub fn safe(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if state.view.status != SwitchStatus::Unsafe {
            return Err(Error::internal(format!(
                "safe reached from {:?}",
                state.view.status
            )));
        }
        state.view.old = None;
        state.view.status = SwitchStatus::Safe;
        self.changed.notify_all();
        Ok(state.view.epoch)
    }

    /// IN_PROGRESS -> SAFE with `next` current and the epoch advanced
    pub fn change(&self, next: Arc<dyn ReplicationProtocol>) -> Result<u64> {
        let mut state = self.state.lock();
        if state.view.status != SwitchStatus::InProgress {
            return Err(Error::internal(format!(
                "protocol changed from {:?}",
                state.view.status
            )));
        }
        state.view.current = next;
        state.view.old = None;
        state.view.epoch += 1;
        state.view.status = SwitchStatus::Safe;
        self.changed.notify_all();
        Ok(state.view.epoch)
    }

    /// Give up a running switch. From UNSAFE the previous protocol comes
    /// back under a new epoch; from IN_PROGRESS nothing was published.
    pub fn abort_switch(&self) -> u64 {
        let mut state = self.state.lock();
        match state.view.status {
            SwitchStatus::Safe => {}
            SwitchStatus::InProgress => {
                state.view.old = None;
                state.view.status = SwitchStatus::Safe;
            }
            SwitchStatus::Unsafe => {
                if let Some(previous) = state.view.old.take() {
                    state.view.current = previous;
                }
                state.view.epoch += 1;
                state.view.status = SwitchStatus::Safe;
            }
        }
        self.changed.notify_all();
        state.view.epoch
    }

    /// Block while a stop-the-world switch is IN_PROGRESS, then return the
    /// state to admit a local transaction under
    pub fn wait_admission(&self) -> Result<ProtocolView> {
        let mut state = self.state.lock();
        while state.view.status == SwitchStatus::InProgress && !state.closed {
            self.changed.wait(&mut state);
        }
        if state.closed {
            return Err(Error::interrupted("protocol manager closed"));
        }
        Ok(state.view.clone())
    }

    /// Block until the local epoch reaches `epoch`
    pub fn wait_for_epoch(&self, epoch: u64) -> Result<ProtocolView> {
        let mut state = self.state.lock();
        while state.view.epoch < epoch && !state.closed {
            self.changed.wait(&mut state);
        }
        if state.view.epoch < epoch {
            return Err(Error::interrupted(format!(
                "closed while waiting for epoch {}",
                epoch
            )));
        }
        Ok(state.view.clone())
    }

    /// Wake every waiter; later waits fail
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.changed.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandReply, ReplicationCommand};
    use crate::protocol::InFlightTransactions;
    use crate::transaction::LocalTransaction;
    use crate::version::NodeId;
    use std::thread;
    use std::time::Duration;

    struct Named(&'static str, InFlightTransactions);

    impl ReplicationProtocol for Named {
        fn id(&self) -> &str {
            self.0
        }
        fn uses_total_order(&self) -> bool {
            false
        }
        fn in_flight(&self) -> &InFlightTransactions {
            &self.1
        }
        fn can_switch_to(&self, _target: &dyn ReplicationProtocol) -> bool {
            true
        }
        fn commit_transaction(&self, _tx: &LocalTransaction) -> Result<()> {
            Ok(())
        }
        fn process_transaction(&self, _from: NodeId, _cmd: ReplicationCommand) -> Result<CommandReply> {
            Ok(CommandReply::Ack)
        }
    }

    fn protocol(id: &'static str) -> Arc<dyn ReplicationProtocol> {
        Arc::new(Named(id, InFlightTransactions::new(id)))
    }

    fn assert_exclusive(manager: &ProtocolManager) {
        let view = manager.view();
        if view.status == SwitchStatus::Safe {
            assert!(view.old.is_none());
        }
    }

    #[test]
    fn test_stop_the_world_transitions() {
        let manager = ProtocolManager::new(protocol("A"));
        manager.reserve().unwrap();
        assert_eq!(manager.status(), SwitchStatus::InProgress);
        assert!(matches!(manager.reserve(), Err(Error::SwitchInProgress)));

        assert_eq!(manager.change(protocol("B")).unwrap(), 1);
        assert_eq!(manager.current().id(), "B");
        assert_exclusive(&manager);
    }

    #[test]
    fn test_unsafe_window_and_abort() {
        let manager = ProtocolManager::new(protocol("A"));
        manager.reserve().unwrap();
        manager.begin_unsafe(protocol("B")).unwrap();
        assert_eq!(manager.status(), SwitchStatus::Unsafe);
        assert_eq!(manager.old().unwrap().id(), "A");

        assert_eq!(manager.abort_switch(), 2);
        assert_eq!(manager.current().id(), "A");
        assert_exclusive(&manager);
    }

    #[test]
    fn test_wait_for_epoch() {
        let manager = Arc::new(ProtocolManager::new(protocol("A")));
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait_for_epoch(1).map(|v| v.current.id().to_string()))
        };
        thread::sleep(Duration::from_millis(20));
        manager.reserve().unwrap();
        manager.change(protocol("B")).unwrap();
        assert_eq!(waiter.join().unwrap().unwrap(), "B");
    }

    #[test]
    fn test_close_releases_waiters() {
        let manager = Arc::new(ProtocolManager::new(protocol("A")));
        manager.reserve().unwrap();
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait_admission())
        };
        thread::sleep(Duration::from_millis(20));
        manager.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted(_))));
    }
}
