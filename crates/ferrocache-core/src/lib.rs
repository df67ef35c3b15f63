//! Ferrocache Core - transaction ordering and commit protocols
//!
//! This crate is the replication core of the Ferrocache replicated
//! key-value cache:
//! - Sorted queue of prepared transactions ordered by the node-local
//!   component of their vector version
//! - Commit manager with a single applier thread per node
//! - Total order validation, sequential or parallel with per-key
//!   dependency latches
//! - Two-phase commit, primary-backup and total order protocols
//! - Live protocol switching with epochs, stop-the-world or non-blocking
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │     ReconfigurableReplicationManager        │
//! │   (registry, epochs, switch, routing)       │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        Replication Protocols                │
//! │        (2PC, PB, TO over Transport)         │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │        TotalOrderManager                    │
//! │  (sequential / parallel, latches, pool)     │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │   TransactionCommitManager + Applier        │
//! │  (SortedTransactionQueue, CommitLog, store) │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod commit_log;
pub mod commit_manager;
pub mod config;
pub mod error;
pub mod latch;
pub mod node;
pub mod protocol;
pub mod queue;
pub mod reconfig;
pub mod storage;
pub mod testing;
pub mod total_order;
pub mod transaction;
pub mod transport;
pub mod version;

pub use command::{CommandReply, ReplicationCommand, TxPayload};
pub use commit_log::{CommitLog, CommittedBatch, CommittedTransactionRecord};
pub use commit_manager::{CommitManagerStats, TransactionCommitManager};
pub use config::{CoreConfig, ValidationStrategy};
pub use error::{Error, Result};
pub use latch::{DependencyLatch, LatchOutcome};
pub use node::CacheNode;
pub use protocol::{ReplicationProtocol, PASSIVE_REPLICATION, TOTAL_ORDER, TWO_PHASE_COMMIT};
pub use queue::{SortedTransactionQueue, TransactionEntry};
pub use reconfig::{
    ReconfigurableReplicationManager, ReconfigurationReport, SwitchHandle, SwitchRecord,
    SwitchStatus,
};
pub use storage::{DataContainer, InMemoryDataContainer};
pub use total_order::{TotalOrderManager, build_total_order_manager};
pub use transaction::{
    CacheTransaction, CommitOutcome, EpochStamp, GlobalTransactionId, LocalTransaction, WriteOp,
};
pub use transport::{CommandHandler, DeliveryMode, Transport};
pub use version::{NodeId, Version, VersionGenerator, WriteVersion};
