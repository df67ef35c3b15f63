//! Participant side of the lock-based protocols

use super::{KeyLocks, ProtocolContext};
use crate::command::{CommandReply, ReplicationCommand, TxPayload};
use crate::total_order::PrepareValidator;
use crate::transaction::{CacheTransaction, EpochStamp, GlobalTransactionId, ReplyHandle, TxState};
use crate::version::Version;
use crate::Result;
use dashmap::DashMap;
use std::sync::Arc;

/// Prepared remote transactions waiting for the coordinator's decision
pub struct RemoteParticipant {
    protocol: &'static str,
    ctx: Arc<ProtocolContext>,
    locks: Arc<KeyLocks>,
    prepared: DashMap<GlobalTransactionId, Arc<CacheTransaction>>,
}

impl RemoteParticipant {
    /// Participant for `protocol`, sharing `locks` with its local commits
    pub fn new(protocol: &'static str, ctx: Arc<ProtocolContext>, locks: Arc<KeyLocks>) -> Self {
        Self {
            protocol,
            ctx,
            locks,
            prepared: DashMap::new(),
        }
    }

    /// Dispatch a command. `validate` selects lock acquisition and
    /// write-skew checks; backups of a primary skip both.
    pub fn handle(&self, command: ReplicationCommand, validate: bool) -> Result<CommandReply> {
        match command {
            ReplicationCommand::Prepare { tx, one_phase } => self.prepare(&tx, one_phase, validate),
            ReplicationCommand::Commit {
                gtx,
                stamp,
                version,
            } => self.commit(gtx, &stamp, &version),
            ReplicationCommand::Rollback { gtx, .. } => self.rollback(gtx),
        }
    }

    /// Prepare a remote transaction, committing it right away with
    /// `one_phase`
    pub fn prepare(&self, payload: &TxPayload, one_phase: bool, validate: bool) -> Result<CommandReply> {
        let tx = payload.to_cache_transaction();
        let gtx = tx.gtx();
        let keys = tx.write_keys();

        if validate {
            if let Err(e) = self.locks.lock_all(gtx, &keys) {
                return Ok(CommandReply::Rejected(e.to_string()));
            }
        }

        let version = match self.ctx.validator.prepare(&tx, !validate) {
            Ok(version) => version,
            Err(e) => {
                tracing::debug!(%gtx, protocol = self.protocol, error = %e, "remote prepare rejected");
                self.locks.unlock_all(gtx, &keys);
                if let Err(e) = tx.transition(TxState::RolledBack) {
                    tracing::warn!(%gtx, error = %e, "rejected transaction in unexpected state");
                }
                tx.latch().release(tx.latch_outcome());
                return Ok(CommandReply::Rejected(e.to_string()));
            }
        };

        if one_phase {
            self.commit_now(&tx, &version)?;
        } else {
            self.prepared.insert(gtx, tx);
        }
        Ok(CommandReply::Prepared { version })
    }

    /// Commit at the coordinator's final version. A transaction with no
    /// local footprint only advances visibility.
    pub fn commit(
        &self,
        gtx: GlobalTransactionId,
        stamp: &EpochStamp,
        version: &Version,
    ) -> Result<CommandReply> {
        match self.prepared.remove(&gtx) {
            Some((_, tx)) => self.commit_now(&tx, version)?,
            None => {
                let tx = CacheTransaction::without_footprint(gtx, stamp.clone());
                self.ctx.commit_manager.commit_transaction(&tx, version)?;
                tx.latch().release(tx.latch_outcome());
            }
        }
        Ok(CommandReply::Ack)
    }

    /// Discard a prepared transaction
    pub fn rollback(&self, gtx: GlobalTransactionId) -> Result<CommandReply> {
        if let Some((_, tx)) = self.prepared.remove(&gtx) {
            let result = self.ctx.validator.rollback(&tx);
            self.locks.unlock_all(gtx, &tx.write_keys());
            tx.latch().release(tx.latch_outcome());
            result?;
        }
        Ok(CommandReply::Ack)
    }

    /// Prepared transactions awaiting a decision
    pub fn prepared_count(&self) -> usize {
        self.prepared.len()
    }

    fn commit_now(&self, tx: &Arc<CacheTransaction>, version: &Version) -> Result<()> {
        self.ctx.commit_manager.commit_transaction(tx, version)?;
        let locks = self.locks.clone();
        let owned = tx.clone();
        let reply = ReplyHandle::new(move |_| {
            locks.unlock_all(owned.gtx(), &owned.write_keys());
            owned.latch().release(owned.latch_outcome());
        });
        self.ctx.validator.await_applied(tx, Some(reply))
    }
}
