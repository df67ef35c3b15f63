//! Two-phase commit

use super::{
    InFlightTransactions, KeyLocks, ProtocolContext, RemoteParticipant, ReplicationProtocol,
    TOTAL_ORDER, TWO_PHASE_COMMIT, collect_prepared,
};
use crate::command::{CommandReply, ReplicationCommand, TxPayload};
use crate::total_order::PrepareValidator;
use crate::transaction::{CacheTransaction, LocalTransaction};
use crate::transport::DeliveryMode;
use crate::version::NodeId;
use crate::{Error, Result};
use std::sync::Arc;

/// Lock-based two-phase commit. The coordinator prepares locally, gathers
/// the participants' prepared versions, commits everywhere at their merged
/// maximum and returns once its own copy is applied.
pub struct TwoPhaseCommitProtocol {
    ctx: Arc<ProtocolContext>,
    in_flight: InFlightTransactions,
    locks: Arc<KeyLocks>,
    participant: RemoteParticipant,
}

impl TwoPhaseCommitProtocol {
    /// Create the protocol over the node's collaborators
    pub fn new(ctx: Arc<ProtocolContext>) -> Self {
        let locks = Arc::new(KeyLocks::new());
        Self {
            participant: RemoteParticipant::new(TWO_PHASE_COMMIT, ctx.clone(), locks.clone()),
            in_flight: InFlightTransactions::new(TWO_PHASE_COMMIT),
            locks,
            ctx,
        }
    }

    /// Participant state
    pub fn participant(&self) -> &RemoteParticipant {
        &self.participant
    }

    fn abort_everywhere(&self, tx: &Arc<CacheTransaction>, error: Error) -> Error {
        tracing::debug!(gtx = %tx.gtx(), error = %error, "aborting two-phase commit");
        let rollback = ReplicationCommand::Rollback {
            gtx: tx.gtx(),
            stamp: tx.stamp().clone(),
        };
        if let Err(e) = self.ctx.transport.broadcast(rollback, DeliveryMode::Asynchronous) {
            tracing::warn!(gtx = %tx.gtx(), error = %e, "rollback broadcast failed");
        }
        if let Err(e) = self.ctx.validator.rollback(tx) {
            tracing::warn!(gtx = %tx.gtx(), error = %e, "local rollback failed");
        }
        self.locks.unlock_all(tx.gtx(), &tx.write_keys());
        tx.latch().release(tx.latch_outcome());
        error
    }
}

impl ReplicationProtocol for TwoPhaseCommitProtocol {
    fn id(&self) -> &str {
        TWO_PHASE_COMMIT
    }

    fn uses_total_order(&self) -> bool {
        false
    }

    fn in_flight(&self) -> &InFlightTransactions {
        &self.in_flight
    }

    fn can_switch_to(&self, target: &dyn ReplicationProtocol) -> bool {
        target.id() == TOTAL_ORDER
    }

    fn commit_transaction(&self, local: &LocalTransaction) -> Result<()> {
        if local.is_read_only() {
            return Ok(());
        }

        let guard = self.in_flight.begin(local.gtx())?;
        let tx = local.to_cache_transaction()?;
        let gtx = tx.gtx();
        let keys = tx.write_keys();

        self.locks.lock_all(gtx, &keys)?;
        let local_version = match self.ctx.validator.prepare(&tx, false) {
            Ok(version) => version,
            Err(e) => {
                self.locks.unlock_all(gtx, &keys);
                tx.latch().release(tx.latch_outcome());
                return Err(e);
            }
        };

        let prepare = ReplicationCommand::Prepare {
            tx: TxPayload::from(tx.as_ref()),
            one_phase: false,
        };
        let mut prepared = match self
            .ctx
            .transport
            .broadcast(prepare, DeliveryMode::Synchronous)
            .and_then(collect_prepared)
        {
            Ok(prepared) => prepared,
            Err(e) => return Err(self.abort_everywhere(&tx, e)),
        };
        if let Err(e) = guard.enter_commit() {
            return Err(self.abort_everywhere(&tx, e));
        }

        prepared.push((self.ctx.node(), local_version));
        let final_version = self.ctx.commit_manager.generator().merge_and_max(&prepared);
        tracing::debug!(%gtx, version = %final_version, participants = prepared.len(), "committing");

        let commit = ReplicationCommand::Commit {
            gtx,
            stamp: tx.stamp().clone(),
            version: final_version.clone(),
        };
        if let Err(e) = self
            .ctx
            .transport
            .broadcast(commit, DeliveryMode::Synchronous)
        {
            tracing::error!(%gtx, error = %e, "commit broadcast failed after the decision");
        }

        let result = self
            .ctx
            .commit_manager
            .commit_transaction(&tx, &final_version)
            .and_then(|_| self.ctx.validator.await_applied(&tx, None));
        self.locks.unlock_all(gtx, &keys);
        tx.latch().release(tx.latch_outcome());
        result
    }

    fn process_transaction(&self, _from: NodeId, command: ReplicationCommand) -> Result<CommandReply> {
        self.participant.handle(command, true)
    }
}
