//! Error types for Ferrocache Core

use std::time::Duration;
use thiserror::Error;

/// Result type alias using Ferrocache Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the transaction ordering and replication layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A transaction was handed to the applier below the committed watermark
    #[error("Ordering violation: {0}")]
    OrderingViolation(String),

    /// A concurrent write invalidated the transaction's read snapshot
    #[error("Write skew detected on key {key}")]
    WriteSkew {
        /// Hex rendering of the conflicting key
        key: String,
    },

    /// The referenced protocol id is not registered
    #[error("No such protocol: {0}")]
    NoSuchProtocol(String),

    /// A switch is already running (IN_PROGRESS or UNSAFE)
    #[error("Protocol switch already in progress")]
    SwitchInProgress,

    /// A switch was requested inside the cool-down window
    #[error("Protocol switch rejected: cool-down active for another {remaining:?}")]
    SwitchCoolDown {
        /// Time left before another switch is accepted
        remaining: Duration,
    },

    /// The requested protocol is already the current one
    #[error("Protocol {0} is already active")]
    SameProtocol(String),

    /// A wait on a dependency or a reply did not complete in time
    #[error("Dependency timeout: {0}")]
    DependencyTimeout(String),

    /// A background loop or a blocked caller observed shutdown
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// The transaction was aborted (rollback, stop-the-world abort, rejection)
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    /// Generic transaction errors (duplicate ids, unknown transactions)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Transport collaborator failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage container failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an ordering violation error
    pub fn ordering(msg: impl Into<String>) -> Self {
        Self::OrderingViolation(msg.into())
    }

    /// Create a write skew error for a raw key
    pub fn write_skew(key: &[u8]) -> Self {
        let key = key.iter().map(|b| format!("{:02x}", b)).collect();
        Self::WriteSkew { key }
    }

    /// Create a no-such-protocol error
    pub fn no_such_protocol(id: impl Into<String>) -> Self {
        Self::NoSuchProtocol(id.into())
    }

    /// Create an interrupted error
    pub fn interrupted(msg: impl Into<String>) -> Self {
        Self::Interrupted(msg.into())
    }

    /// Create an aborted-transaction error
    pub fn aborted(msg: impl Into<String>) -> Self {
        Self::TransactionAborted(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the failure means the transaction must be reported as aborted
    /// to its originator.
    pub fn is_abort(&self) -> bool {
        matches!(
            self,
            Self::WriteSkew { .. }
                | Self::TransactionAborted(_)
                | Self::NoSuchProtocol(_)
                | Self::OrderingViolation(_)
        )
    }
}
