//! Passive replication (primary-backup)

use super::{
    InFlightTransactions, KeyLocks, PASSIVE_REPLICATION, ProtocolContext, RemoteParticipant,
    ReplicationProtocol, collect_prepared,
};
use crate::command::{CommandReply, ReplicationCommand, TxPayload};
use crate::total_order::PrepareValidator;
use crate::transaction::{CacheTransaction, LocalTransaction, TxState};
use crate::transport::DeliveryMode;
use crate::version::NodeId;
use crate::{Error, Result};
use std::sync::Arc;

/// Only the primary (the group coordinator) runs write transactions. It
/// validates locally and pushes a one-phase commit to the backups, which
/// apply it without validating.
pub struct PassiveReplicationProtocol {
    ctx: Arc<ProtocolContext>,
    in_flight: InFlightTransactions,
    locks: Arc<KeyLocks>,
    participant: RemoteParticipant,
}

impl PassiveReplicationProtocol {
    /// Create the protocol over the node's collaborators
    pub fn new(ctx: Arc<ProtocolContext>) -> Self {
        let locks = Arc::new(KeyLocks::new());
        Self {
            participant: RemoteParticipant::new(PASSIVE_REPLICATION, ctx.clone(), locks.clone()),
            in_flight: InFlightTransactions::new(PASSIVE_REPLICATION),
            locks,
            ctx,
        }
    }
}

impl ReplicationProtocol for PassiveReplicationProtocol {
    fn id(&self) -> &str {
        PASSIVE_REPLICATION
    }

    fn uses_total_order(&self) -> bool {
        false
    }

    fn in_flight(&self) -> &InFlightTransactions {
        &self.in_flight
    }

    fn can_switch_to(&self, _target: &dyn ReplicationProtocol) -> bool {
        false
    }

    fn commit_transaction(&self, local: &LocalTransaction) -> Result<()> {
        if local.is_read_only() {
            return Ok(());
        }
        if !self.ctx.transport.is_coordinator() {
            return Err(Error::aborted(format!(
                "{} writes on backup node {}",
                local.gtx(),
                self.ctx.node()
            )));
        }

        let guard = self.in_flight.begin(local.gtx())?;
        let tx = local.to_cache_transaction()?;
        let gtx = tx.gtx();
        let keys = tx.write_keys();

        self.locks.lock_all(gtx, &keys)?;
        let release = |tx: &CacheTransaction| {
            self.locks.unlock_all(gtx, &keys);
            tx.latch().release(tx.latch_outcome());
        };

        let local_version = match self
            .ctx
            .validator
            .prepare(&tx, false)
            .and_then(|version| guard.enter_commit().map(|_| version))
        {
            Ok(version) => version,
            Err(e) => {
                if tx.state() != TxState::Preparing {
                    if let Err(e) = self.ctx.validator.rollback(&tx) {
                        tracing::warn!(gtx = %tx.gtx(), error = %e, "rollback after failed prepare");
                    }
                }
                release(&tx);
                return Err(e);
            }
        };

        // Past the commit point: backups follow the primary
        let push = ReplicationCommand::Prepare {
            tx: TxPayload::from(tx.as_ref()),
            one_phase: true,
        };
        let mut versions = match self
            .ctx
            .transport
            .broadcast(push, DeliveryMode::Synchronous)
            .and_then(collect_prepared)
        {
            Ok(versions) => versions,
            Err(e) => {
                tracing::error!(%gtx, error = %e, "backups did not take the update");
                Vec::new()
            }
        };
        versions.push((self.ctx.node(), local_version));
        let final_version = self.ctx.commit_manager.generator().merge_and_max(&versions);

        let result = self
            .ctx
            .commit_manager
            .commit_transaction(&tx, &final_version)
            .and_then(|_| self.ctx.validator.await_applied(&tx, None));
        release(&tx);
        result
    }

    fn process_transaction(&self, from: NodeId, command: ReplicationCommand) -> Result<CommandReply> {
        tracing::trace!(from, kind = command.kind(), "backup update");
        self.participant.handle(command, false)
    }
}
