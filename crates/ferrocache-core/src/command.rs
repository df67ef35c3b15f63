//! Replication commands exchanged between nodes
//!
//! Commands are plain serde types; the byte encoding belongs to the
//! transport.

use crate::transaction::{CacheTransaction, EpochStamp, GlobalTransactionId, ObservedWriters, WriteOp};
use crate::version::Version;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Transaction body carried by a prepare
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxPayload {
    /// Transaction id
    pub gtx: GlobalTransactionId,
    /// Ordered writes
    pub write_set: Vec<WriteOp>,
    /// Keys read, when tracked
    pub read_set: Option<BTreeSet<Bytes>>,
    /// Snapshot the originator read from
    pub snapshot: Version,
    /// Admission stamp
    pub stamp: EpochStamp,
    /// Writers the originator observed, per key
    #[serde(default, with = "observed_pairs")]
    pub observed: ObservedWriters,
}

impl TxPayload {
    /// Fresh node-local record of this transaction
    pub fn to_cache_transaction(&self) -> Arc<CacheTransaction> {
        CacheTransaction::with_observed(
            self.gtx,
            self.write_set.clone(),
            self.read_set.clone(),
            self.snapshot.clone(),
            self.stamp.clone(),
            self.observed.clone(),
        )
    }

    /// Keys written
    pub fn write_keys(&self) -> BTreeSet<Bytes> {
        self.write_set.iter().map(|op| op.key().clone()).collect()
    }
}

impl From<&CacheTransaction> for TxPayload {
    fn from(tx: &CacheTransaction) -> Self {
        Self {
            gtx: tx.gtx(),
            write_set: tx.write_set().to_vec(),
            read_set: tx.read_set().cloned(),
            snapshot: tx.snapshot().clone(),
            stamp: tx.stamp().clone(),
            observed: tx.observed().clone(),
        }
    }
}

/// Byte-string map keys are not valid in every format; encode as pairs
mod observed_pairs {
    use super::ObservedWriters;
    use crate::transaction::GlobalTransactionId;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(observed: &ObservedWriters, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(observed.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ObservedWriters, D::Error> {
        let pairs: Vec<(Bytes, Option<GlobalTransactionId>)> = Vec::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

/// Command sent by a coordinator to the participants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationCommand {
    /// Validate and prepare; with `one_phase` the receiver also commits
    Prepare {
        /// Transaction body
        tx: TxPayload,
        /// Commit right after a successful prepare
        one_phase: bool,
    },
    /// Commit at the agreed version
    Commit {
        /// Transaction id
        gtx: GlobalTransactionId,
        /// Admission stamp
        stamp: EpochStamp,
        /// Final version
        version: Version,
    },
    /// Discard
    Rollback {
        /// Transaction id
        gtx: GlobalTransactionId,
        /// Admission stamp
        stamp: EpochStamp,
    },
}

impl ReplicationCommand {
    /// Transaction this command refers to
    pub fn gtx(&self) -> GlobalTransactionId {
        match self {
            Self::Prepare { tx, .. } => tx.gtx,
            Self::Commit { gtx, .. } | Self::Rollback { gtx, .. } => *gtx,
        }
    }

    /// Admission stamp
    pub fn stamp(&self) -> &EpochStamp {
        match self {
            Self::Prepare { tx, .. } => &tx.stamp,
            Self::Commit { stamp, .. } | Self::Rollback { stamp, .. } => stamp,
        }
    }

    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Prepare { one_phase: true, .. } => "prepare-1pc",
            Self::Prepare { .. } => "prepare",
            Self::Commit { .. } => "commit",
            Self::Rollback { .. } => "rollback",
        }
    }
}

/// Reply to a [`ReplicationCommand`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandReply {
    /// Prepared at this version
    Prepared {
        /// Provisional version on the replying node
        version: Version,
    },
    /// Done
    Ack,
    /// Refused; the transaction must abort
    Rejected(String),
    /// Stamped with a protocol the receiver no longer routes to; resend
    /// under the current stamp
    Retransmit,
}

impl CommandReply {
    /// Whether the reply lets the transaction go on
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Prepared { .. } | Self::Ack)
    }
}
