//! Replication protocols
//!
//! Each protocol is a strategy for committing a local transaction across
//! the group and for handling the commands other nodes send under it.
//! The reconfiguration manager picks the active one and drives switches
//! through the lifecycle hooks of [`ReplicationProtocol`].

mod in_flight;
mod locks;
mod participant;
mod passive;
mod total_order;
mod two_phase;

pub use in_flight::{InFlightGuard, InFlightTransactions};
pub use locks::KeyLocks;
pub use participant::RemoteParticipant;
pub use passive::PassiveReplicationProtocol;
pub use total_order::TotalOrderProtocol;
pub use two_phase::TwoPhaseCommitProtocol;

use crate::command::{CommandReply, ReplicationCommand};
use crate::commit_manager::TransactionCommitManager;
use crate::config::CoreConfig;
use crate::total_order::{SnapshotValidator, TotalOrderManager};
use crate::transaction::LocalTransaction;
use crate::transport::Transport;
use crate::version::NodeId;
use crate::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Id of [`TwoPhaseCommitProtocol`]
pub const TWO_PHASE_COMMIT: &str = "2PC";
/// Id of [`PassiveReplicationProtocol`]
pub const PASSIVE_REPLICATION: &str = "PB";
/// Id of [`TotalOrderProtocol`]
pub const TOTAL_ORDER: &str = "TO";

/// Collaborators shared by the protocols of one node
pub struct ProtocolContext {
    /// Node configuration
    pub config: CoreConfig,
    /// Group communication
    pub transport: Arc<dyn Transport>,
    /// Local commit manager
    pub commit_manager: Arc<TransactionCommitManager>,
    /// Snapshot validation
    pub validator: Arc<SnapshotValidator>,
    /// Total order validation
    pub total_order: Arc<dyn TotalOrderManager>,
}

impl ProtocolContext {
    /// Local node
    pub fn node(&self) -> NodeId {
        self.config.node_id
    }
}

/// A pluggable commit protocol
pub trait ReplicationProtocol: Send + Sync {
    /// Unique id, also carried in transaction stamps
    fn id(&self) -> &str;

    /// Whether the protocol relies on total order delivery
    fn uses_total_order(&self) -> bool;

    /// In-flight local transactions
    fn in_flight(&self) -> &InFlightTransactions;

    /// Start admitting local transactions
    fn boot_protocol(&self) -> Result<()> {
        self.in_flight().resume();
        tracing::info!(protocol = self.id(), "protocol booted");
        Ok(())
    }

    /// Stop admitting local transactions. With `abort_in_flight` the ones
    /// that did not reach their commit point are aborted; the rest drain.
    /// Returns how many were aborted.
    fn stop_protocol(&self, abort_in_flight: bool) -> Result<u64> {
        let in_flight = self.in_flight();
        in_flight.stop_admitting();
        let aborted = if abort_in_flight { in_flight.abort_all() } else { 0 };
        drain(self.id(), in_flight);
        tracing::info!(protocol = self.id(), aborted, "protocol stopped");
        Ok(aborted)
    }

    /// Whether a switch to `target` can run without stopping the world
    fn can_switch_to(&self, target: &dyn ReplicationProtocol) -> bool;

    /// Non-blocking switch: hand admission over to the already booted
    /// `target` and drain this protocol's in-flight transactions.
    fn switch_to(&self, target: &dyn ReplicationProtocol) -> Result<u64> {
        if !self.can_switch_to(target) {
            return Err(Error::internal(format!(
                "{} cannot switch to {} without stopping",
                self.id(),
                target.id()
            )));
        }
        self.in_flight().stop_admitting();
        drain(self.id(), self.in_flight());
        tracing::info!(from = self.id(), to = target.id(), "in-flight transactions drained");
        Ok(0)
    }

    /// Hook run when a local transaction begins under this protocol
    fn start_transaction(&self, tx: &LocalTransaction) -> Result<()> {
        if !self.in_flight().is_admitting() {
            return Err(Error::aborted(format!(
                "{} started while {} is stopped",
                tx.gtx(),
                self.id()
            )));
        }
        Ok(())
    }

    /// Commit a stamped local transaction across the group
    fn commit_transaction(&self, tx: &LocalTransaction) -> Result<()>;

    /// Handle a command stamped with this protocol at the current epoch
    fn process_transaction(&self, from: NodeId, command: ReplicationCommand) -> Result<CommandReply>;

    /// Handle a command stamped with an older epoch
    fn process_old_transaction(
        &self,
        from: NodeId,
        command: ReplicationCommand,
    ) -> Result<CommandReply> {
        self.process_transaction(from, command)
    }

    /// Handle a command at the current epoch while a non-blocking switch
    /// is still draining
    fn process_speculative_transaction(
        &self,
        from: NodeId,
        command: ReplicationCommand,
    ) -> Result<CommandReply> {
        self.process_transaction(from, command)
    }
}

fn drain(protocol: &str, in_flight: &InFlightTransactions) {
    while !in_flight.wait_drained(Duration::from_secs(5)) {
        tracing::warn!(protocol, remaining = in_flight.len(), "still draining in-flight transactions");
    }
}

/// Fold synchronous replies into prepared versions, failing on the first
/// rejection
pub(crate) fn collect_prepared(
    replies: Vec<(NodeId, CommandReply)>,
) -> Result<Vec<(NodeId, crate::version::Version)>> {
    let mut prepared = Vec::with_capacity(replies.len());
    for (node, reply) in replies {
        match reply {
            CommandReply::Prepared { version } => prepared.push((node, version)),
            CommandReply::Ack => {}
            CommandReply::Rejected(reason) => {
                return Err(Error::aborted(format!("node {} rejected: {}", node, reason)));
            }
            CommandReply::Retransmit => {
                return Err(Error::aborted(format!(
                    "node {} asked for a retransmission",
                    node
                )));
            }
        }
    }
    Ok(prepared)
}
