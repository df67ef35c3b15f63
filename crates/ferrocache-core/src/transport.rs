//! Transport contract
//!
//! Group communication is external. The core only needs to broadcast or
//! send commands, learn the members and ask who coordinates.

use crate::command::{CommandReply, ReplicationCommand};
use crate::version::NodeId;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a command is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Wait for every recipient's reply
    Synchronous,
    /// Fire and forget
    Asynchronous,
    /// Total order broadcast: same order on every member, sender included
    TotalOrder,
}

/// Group communication used by the protocols
pub trait Transport: Send + Sync {
    /// This node
    fn local_node(&self) -> NodeId;

    /// Current members, this node included
    fn members(&self) -> Vec<NodeId>;

    /// Whether this node coordinates the group (primary in passive
    /// replication)
    fn is_coordinator(&self) -> bool;

    /// Send `command` to every other member, or to every member including
    /// this one in [`DeliveryMode::TotalOrder`]. Replies are only collected
    /// in synchronous mode.
    fn broadcast(
        &self,
        command: ReplicationCommand,
        mode: DeliveryMode,
    ) -> Result<Vec<(NodeId, CommandReply)>>;

    /// Send `command` to `recipients`
    fn send(
        &self,
        recipients: &[NodeId],
        command: ReplicationCommand,
        mode: DeliveryMode,
        timeout: Duration,
    ) -> Result<Vec<(NodeId, CommandReply)>>;
}

/// Inbound side of the transport
pub trait CommandHandler: Send + Sync {
    /// Handle a command delivered from `from`
    fn handle(&self, from: NodeId, command: ReplicationCommand) -> Result<CommandReply>;
}
