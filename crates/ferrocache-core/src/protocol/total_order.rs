//! Total order broadcast protocol

use super::{InFlightTransactions, ProtocolContext, ReplicationProtocol, TOTAL_ORDER, TWO_PHASE_COMMIT};
use crate::command::{CommandReply, ReplicationCommand, TxPayload};
use crate::total_order::{Outcome, SequencedPrepare};
use crate::transaction::LocalTransaction;
use crate::transport::DeliveryMode;
use crate::version::NodeId;
use crate::{Error, Result};
use std::sync::Arc;

/// Every node validates every transaction in the same delivery order, so
/// no locks and no voting are needed: the originator broadcasts a one-phase
/// prepare to the whole group, itself included, and waits for its own
/// validation outcome.
pub struct TotalOrderProtocol {
    ctx: Arc<ProtocolContext>,
    in_flight: InFlightTransactions,
}

impl TotalOrderProtocol {
    /// Create the protocol over the node's collaborators
    pub fn new(ctx: Arc<ProtocolContext>) -> Self {
        Self {
            ctx,
            in_flight: InFlightTransactions::new(TOTAL_ORDER),
        }
    }
}

fn outcome_to_reply(outcome: Outcome) -> CommandReply {
    match outcome {
        Outcome::Applied | Outcome::Queued => CommandReply::Ack,
        Outcome::Prepared(version) => CommandReply::Prepared { version },
        Outcome::Retransmit => CommandReply::Retransmit,
        Outcome::Rejected(reason) => CommandReply::Rejected(reason),
    }
}

impl ReplicationProtocol for TotalOrderProtocol {
    fn id(&self) -> &str {
        TOTAL_ORDER
    }

    fn uses_total_order(&self) -> bool {
        true
    }

    fn in_flight(&self) -> &InFlightTransactions {
        &self.in_flight
    }

    fn can_switch_to(&self, target: &dyn ReplicationProtocol) -> bool {
        target.id() == TWO_PHASE_COMMIT
    }

    fn commit_transaction(&self, local: &LocalTransaction) -> Result<()> {
        if local.is_read_only() {
            return Ok(());
        }

        let guard = self.in_flight.begin(local.gtx())?;
        let tx = local.to_cache_transaction()?;
        let gtx = tx.gtx();
        guard.enter_commit()?;

        let total_order = &self.ctx.total_order;
        total_order.add_local_transaction(gtx, local.completion().clone());

        let prepare = ReplicationCommand::Prepare {
            tx: TxPayload::from(tx.as_ref()),
            one_phase: true,
        };
        if let Err(e) = self.ctx.transport.broadcast(prepare, DeliveryMode::TotalOrder) {
            // Not delivered anywhere: nothing to undo but the registration
            if let Err(e) = total_order.finish_transaction(gtx, true, Some(&tx)) {
                tracing::warn!(%gtx, error = %e, "failed to drop undelivered transaction");
            }
            return Err(e);
        }

        let result = local.completion().wait(self.ctx.config.remote_timeout);
        if let Err(Error::DependencyTimeout(_)) = &result {
            tracing::warn!(%gtx, "no total order outcome in time");
        }
        result
    }

    fn process_transaction(&self, from: NodeId, command: ReplicationCommand) -> Result<CommandReply> {
        let total_order = &self.ctx.total_order;
        let outcome = match command {
            ReplicationCommand::Prepare { tx, one_phase } => {
                total_order.process_transaction_from_sequencer(SequencedPrepare {
                    tx,
                    one_phase,
                    from,
                })?
            }
            ReplicationCommand::Commit { gtx, version, .. } => {
                total_order.process_commit(gtx, &version)?
            }
            ReplicationCommand::Rollback { gtx, .. } => total_order.process_rollback(gtx)?,
        };
        Ok(outcome_to_reply(outcome))
    }
}
