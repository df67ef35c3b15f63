//! Reconfigurable replication manager
//!
//! Owns the protocol registry and the [`ProtocolManager`], stamps local
//! transactions, routes remote commands by epoch and runs protocol switches
//! on a dedicated thread.

use super::protocol_manager::{ProtocolManager, ProtocolView, SwitchStatus};
use crate::command::{CommandReply, ReplicationCommand};
use crate::protocol::ReplicationProtocol;
use crate::transaction::LocalTransaction;
use crate::version::NodeId;
use crate::{Error, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Attempts to commit a local transaction that keeps meeting a switch
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Completed switches kept for the admin report
const SWITCH_HISTORY_LIMIT: usize = 64;

/// Statistics of one completed switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchRecord {
    /// Protocol replaced
    pub from: String,
    /// Protocol installed
    pub to: String,
    /// Epoch published by the switch
    pub epoch: u64,
    /// Whether the switch stopped the world
    pub stop_the_world: bool,
    /// Time until the new protocol admitted transactions (non-blocking only)
    pub duration_to_unsafe: Option<Duration>,
    /// Time until the manager was SAFE again
    pub duration_to_safe: Duration,
    /// In-flight transactions aborted by the switch
    pub aborted_transactions: u64,
}

/// Handle on a running switch
#[derive(Debug)]
pub struct SwitchHandle {
    from: String,
    to: String,
    result: Receiver<Result<SwitchRecord>>,
}

impl SwitchHandle {
    /// Protocol being replaced
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Protocol being installed
    pub fn to(&self) -> &str {
        &self.to
    }

    /// Block until the switch finished
    pub fn wait(self) -> Result<SwitchRecord> {
        self.result
            .recv()
            .map_err(|_| Error::interrupted("switch thread exited without a result"))?
    }

    /// Block at most `timeout` for the switch to finish
    pub fn wait_timeout(&self, timeout: Duration) -> Result<SwitchRecord> {
        match self.result.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::DependencyTimeout(format!(
                "switch {} -> {} still running",
                self.from, self.to
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::interrupted("switch thread exited without a result"))
            }
        }
    }
}

/// Registered protocol as shown in the admin report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    /// Protocol id
    pub id: String,
    /// Whether it relies on total order delivery
    pub uses_total_order: bool,
}

/// Point-in-time view of the reconfiguration state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconfigurationReport {
    /// Active protocol
    pub current_protocol: String,
    /// Current epoch
    pub epoch: u64,
    /// Switch status
    pub status: SwitchStatus,
    /// Registered protocols
    pub available_protocols: Vec<ProtocolDescriptor>,
    /// Minimum interval between switches
    pub switch_cool_down: Duration,
    /// Completed switches, oldest first
    pub switch_history: Vec<SwitchRecord>,
}

/// Top-level orchestrator of the replication protocols of one node
pub struct ReconfigurableReplicationManager {
    node: NodeId,
    registry: RwLock<BTreeMap<String, Arc<dyn ReplicationProtocol>>>,
    protocol_manager: Arc<ProtocolManager>,
    cool_down: Mutex<Duration>,
    last_switch: Mutex<Option<Instant>>,
    history: Arc<Mutex<VecDeque<SwitchRecord>>>,
    switch_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ReconfigurableReplicationManager {
    /// Manager starting SAFE at epoch 0 with `initial`, which is registered
    /// but not booted
    pub fn new(node: NodeId, initial: Arc<dyn ReplicationProtocol>, cool_down: Duration) -> Self {
        let mut registry = BTreeMap::new();
        registry.insert(initial.id().to_string(), initial.clone());
        Self {
            node,
            registry: RwLock::new(registry),
            protocol_manager: Arc::new(ProtocolManager::new(initial)),
            cool_down: Mutex::new(cool_down),
            last_switch: Mutex::new(None),
            history: Arc::new(Mutex::new(VecDeque::new())),
            switch_thread: Mutex::new(None),
        }
    }

    /// Add a protocol to the registry
    pub fn register_protocol(&self, protocol: Arc<dyn ReplicationProtocol>) -> Result<()> {
        let mut registry = self.registry.write();
        let id = protocol.id().to_string();
        if registry.contains_key(&id) {
            return Err(Error::config(format!("protocol {} registered twice", id)));
        }
        tracing::debug!(node = self.node, protocol = %id, "protocol registered");
        registry.insert(id, protocol);
        Ok(())
    }

    /// Look up a registered protocol
    pub fn protocol(&self, id: &str) -> Result<Arc<dyn ReplicationProtocol>> {
        self.registry
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::no_such_protocol(id))
    }

    /// Boot the current protocol
    pub fn boot(&self) -> Result<()> {
        self.protocol_manager.current().boot_protocol()
    }

    /// Switch to `protocol_id` in the background.
    ///
    /// Fails right away if the protocol is unknown, if the previous switch
    /// is inside the cool-down window, if the protocol is already active or
    /// if a switch is still running.
    pub fn switch_to(
        &self,
        protocol_id: &str,
        force_stop_the_world: bool,
        abort_on_stop: bool,
    ) -> Result<SwitchHandle> {
        let target = self.protocol(protocol_id)?;

        let mut last_switch = self.last_switch.lock();
        if let Some(at) = *last_switch {
            let cool_down = *self.cool_down.lock();
            let elapsed = at.elapsed();
            if elapsed < cool_down {
                return Err(Error::SwitchCoolDown {
                    remaining: cool_down - elapsed,
                });
            }
        }

        if self.protocol_manager.current().id() == target.id() {
            return Err(Error::SameProtocol(protocol_id.to_string()));
        }
        let view = self.protocol_manager.reserve()?;
        *last_switch = Some(Instant::now());
        drop(last_switch);

        let non_blocking = !force_stop_the_world && view.current.can_switch_to(target.as_ref());
        let task = SwitchTask {
            node: self.node,
            protocol_manager: self.protocol_manager.clone(),
            history: self.history.clone(),
            from: view.current.clone(),
            to: target.clone(),
            non_blocking,
            abort_on_stop,
        };
        tracing::info!(
            node = self.node,
            from = view.current.id(),
            to = target.id(),
            non_blocking,
            "protocol switch requested"
        );

        let (sender, receiver) = crossbeam_channel::bounded(1);
        let mut switch_thread = self.switch_thread.lock();
        if let Some(previous) = switch_thread.take() {
            // SAFE was reached, so the previous thread is done or exiting
            let _ = previous.join();
        }
        let spawned = thread::Builder::new()
            .name(format!("protocol-switch-{}", self.node))
            .spawn(move || {
                let _ = sender.send(task.run());
            });
        match spawned {
            Ok(handle) => *switch_thread = Some(handle),
            Err(e) => {
                self.protocol_manager.abort_switch();
                return Err(Error::internal(format!("failed to spawn switch thread: {}", e)));
            }
        }

        Ok(SwitchHandle {
            from: view.current.id().to_string(),
            to: target.id().to_string(),
            result: receiver,
        })
    }

    /// Stamp `local` with the current epoch and protocol, blocking while a
    /// stop-the-world switch runs. Returns the protocol to commit under.
    pub fn notify_local_transaction(
        &self,
        local: &mut LocalTransaction,
    ) -> Result<Arc<dyn ReplicationProtocol>> {
        let view = self.protocol_manager.wait_admission()?;
        local.set_stamp(view.stamp());
        Ok(view.current)
    }

    /// Run the begin hook of the current protocol
    pub fn start_transaction(&self, local: &LocalTransaction) -> Result<()> {
        let view = self.protocol_manager.wait_admission()?;
        view.current.start_transaction(local)
    }

    /// Commit `local` under the current protocol. A commit that meets a
    /// protocol which stopped admitting is restamped and retried.
    pub fn commit(&self, local: &mut LocalTransaction) -> Result<()> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let protocol = self.notify_local_transaction(local)?;
            match protocol.commit_transaction(local) {
                Err(Error::SwitchInProgress) => {
                    tracing::debug!(
                        gtx = %local.gtx(),
                        protocol = protocol.id(),
                        attempt,
                        "protocol stopped admitting, restamping"
                    );
                }
                other => return other,
            }
        }
        Err(Error::SwitchInProgress)
    }

    /// Route a remote command by its stamp
    pub fn notify_remote_transaction(
        &self,
        from: NodeId,
        command: ReplicationCommand,
    ) -> Result<CommandReply> {
        let stamp = command.stamp().clone();
        let mut view = self.protocol_manager.view();
        if stamp.epoch > view.epoch {
            tracing::debug!(
                node = self.node,
                from,
                epoch = stamp.epoch,
                local_epoch = view.epoch,
                "command from a newer epoch, waiting"
            );
            view = self.protocol_manager.wait_for_epoch(stamp.epoch)?;
        }

        if stamp.epoch < view.epoch {
            let protocol = match self.protocol(&stamp.protocol_id) {
                Ok(protocol) => protocol,
                Err(e) => {
                    tracing::warn!(node = self.node, from, gtx = %command.gtx(), error = %e, "old command for unknown protocol");
                    return Ok(CommandReply::Rejected(e.to_string()));
                }
            };
            return protocol.process_old_transaction(from, command);
        }

        if stamp.protocol_id != view.current.id() {
            tracing::warn!(
                node = self.node,
                from,
                gtx = %command.gtx(),
                stamped = %stamp.protocol_id,
                current = view.current.id(),
                "protocol mismatch at the same epoch"
            );
            return Ok(CommandReply::Retransmit);
        }

        match view.status {
            SwitchStatus::Unsafe => view.current.process_speculative_transaction(from, command),
            SwitchStatus::Safe | SwitchStatus::InProgress => {
                view.current.process_transaction(from, command)
            }
        }
    }

    /// Change the minimum interval between switches
    pub fn set_switch_cool_down(&self, cool_down: Duration) {
        *self.cool_down.lock() = cool_down;
    }

    /// Minimum interval between switches
    pub fn switch_cool_down(&self) -> Duration {
        *self.cool_down.lock()
    }

    /// Id of the active protocol
    pub fn current_protocol_id(&self) -> String {
        self.protocol_manager.current().id().to_string()
    }

    /// Registered protocols
    pub fn available_protocols(&self) -> Vec<ProtocolDescriptor> {
        self.registry
            .read()
            .values()
            .map(|p| ProtocolDescriptor {
                id: p.id().to_string(),
                uses_total_order: p.uses_total_order(),
            })
            .collect()
    }

    /// Current epoch
    pub fn current_epoch(&self) -> u64 {
        self.protocol_manager.epoch()
    }

    /// Switch status
    pub fn status(&self) -> SwitchStatus {
        self.protocol_manager.status()
    }

    /// Consistent view of protocol, epoch and status
    pub fn view(&self) -> ProtocolView {
        self.protocol_manager.view()
    }

    /// Completed switches, oldest first
    pub fn switch_history(&self) -> Vec<SwitchRecord> {
        self.history.lock().iter().cloned().collect()
    }

    /// Snapshot for the admin surface
    pub fn report(&self) -> ReconfigurationReport {
        let view = self.protocol_manager.view();
        ReconfigurationReport {
            current_protocol: view.current.id().to_string(),
            epoch: view.epoch,
            status: view.status,
            available_protocols: self.available_protocols(),
            switch_cool_down: self.switch_cool_down(),
            switch_history: self.switch_history(),
        }
    }

    /// The underlying protocol manager
    pub fn protocol_manager(&self) -> &Arc<ProtocolManager> {
        &self.protocol_manager
    }

    /// Wait for a running switch, then release every blocked caller
    pub fn shutdown(&self) {
        if let Some(handle) = self.switch_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!(node = self.node, "protocol switch thread panicked");
            }
        }
        self.protocol_manager.close();
    }
}

impl Drop for ReconfigurableReplicationManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SwitchTask {
    node: NodeId,
    protocol_manager: Arc<ProtocolManager>,
    history: Arc<Mutex<VecDeque<SwitchRecord>>>,
    from: Arc<dyn ReplicationProtocol>,
    to: Arc<dyn ReplicationProtocol>,
    non_blocking: bool,
    abort_on_stop: bool,
}

impl SwitchTask {
    fn run(self) -> Result<SwitchRecord> {
        let started = Instant::now();
        let result = if self.non_blocking {
            self.run_non_blocking(started)
        } else {
            self.run_stop_the_world(started)
        };

        match &result {
            Ok(record) => {
                tracing::info!(
                    node = self.node,
                    from = %record.from,
                    to = %record.to,
                    epoch = record.epoch,
                    stop_the_world = record.stop_the_world,
                    aborted = record.aborted_transactions,
                    elapsed_ms = record.duration_to_safe.as_millis() as u64,
                    "protocol switch complete"
                );
                let mut history = self.history.lock();
                if history.len() == SWITCH_HISTORY_LIMIT {
                    history.pop_front();
                }
                history.push_back(record.clone());
            }
            Err(e) => {
                tracing::error!(
                    node = self.node,
                    from = self.from.id(),
                    to = self.to.id(),
                    error = %e,
                    "protocol switch failed"
                );
            }
        }
        result
    }

    fn run_non_blocking(&self, started: Instant) -> Result<SwitchRecord> {
        if let Err(e) = self.to.boot_protocol() {
            self.protocol_manager.abort_switch();
            return Err(e);
        }
        let epoch = self.protocol_manager.begin_unsafe(self.to.clone())?;
        let duration_to_unsafe = started.elapsed();
        tracing::debug!(node = self.node, epoch, "unsafe window open");

        let aborted = match self.from.switch_to(self.to.as_ref()) {
            Ok(aborted) => aborted,
            Err(e) => {
                self.restore_previous();
                return Err(e);
            }
        };
        self.protocol_manager.safe()?;

        Ok(SwitchRecord {
            from: self.from.id().to_string(),
            to: self.to.id().to_string(),
            epoch,
            stop_the_world: false,
            duration_to_unsafe: Some(duration_to_unsafe),
            duration_to_safe: started.elapsed(),
            aborted_transactions: aborted,
        })
    }

    fn run_stop_the_world(&self, started: Instant) -> Result<SwitchRecord> {
        let aborted = match self.from.stop_protocol(self.abort_on_stop) {
            Ok(aborted) => aborted,
            Err(e) => {
                self.restore_previous();
                return Err(e);
            }
        };
        if let Err(e) = self.to.boot_protocol() {
            self.restore_previous();
            return Err(e);
        }
        let epoch = self.protocol_manager.change(self.to.clone())?;

        Ok(SwitchRecord {
            from: self.from.id().to_string(),
            to: self.to.id().to_string(),
            epoch,
            stop_the_world: true,
            duration_to_unsafe: None,
            duration_to_safe: started.elapsed(),
            aborted_transactions: aborted,
        })
    }

    fn restore_previous(&self) {
        if let Err(e) = self.to.stop_protocol(false) {
            tracing::warn!(node = self.node, protocol = self.to.id(), error = %e, "failed to stop target protocol");
        }
        if let Err(e) = self.from.boot_protocol() {
            tracing::error!(node = self.node, protocol = self.from.id(), error = %e, "failed to reboot previous protocol");
        }
        let epoch = self.protocol_manager.abort_switch();
        tracing::warn!(node = self.node, protocol = self.from.id(), epoch, "switch rolled back");
    }
}
