//! In-process transport for tests and demos
//!
//! [`LoopbackNetwork`] connects several [`CacheNode`](crate::CacheNode)s
//! living in one process. Delivery is a direct call on the receiving
//! node's [`CommandHandler`]; total order broadcasts are serialized by a
//! single sequencer lock so every member sees them in the same order.
//!
//! ```rust,no_run
//! use ferrocache_core::testing::LoopbackNetwork;
//! use ferrocache_core::{CacheNode, CoreConfig, InMemoryDataContainer};
//! use std::sync::Arc;
//!
//! let network = LoopbackNetwork::new();
//! let node = CacheNode::start(
//!     CoreConfig::for_node(1),
//!     network.transport(1),
//!     Arc::new(InMemoryDataContainer::new()),
//! )?;
//! network.attach(1, node.clone());
//! # Ok::<(), ferrocache_core::Error>(())
//! ```

use crate::command::{CommandReply, ReplicationCommand};
use crate::transport::{CommandHandler, DeliveryMode, Transport};
use crate::version::NodeId;
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Shared medium of a group of in-process nodes
#[derive(Default)]
pub struct LoopbackNetwork {
    members: RwLock<BTreeMap<NodeId, Option<Weak<dyn CommandHandler>>>>,
    isolated: RwLock<BTreeSet<NodeId>>,
    sequencer: Mutex<()>,
}

impl LoopbackNetwork {
    /// Empty network
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join `node` and return its transport
    pub fn transport(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackTransport> {
        self.members.write().entry(node).or_insert(None);
        Arc::new(LoopbackTransport {
            node,
            network: self.clone(),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Route deliveries for `node` to `handler`. Only a weak reference is
    /// kept, so the network never keeps a node alive.
    pub fn attach(&self, node: NodeId, handler: Arc<dyn CommandHandler>) {
        self.members
            .write()
            .insert(node, Some(Arc::downgrade(&handler)));
    }

    /// Remove `node` from the group
    pub fn detach(&self, node: NodeId) {
        self.members.write().remove(&node);
    }

    /// Make deliveries to `node` fail until [`heal`](Self::heal)
    pub fn isolate(&self, node: NodeId) {
        self.isolated.write().insert(node);
    }

    /// Undo [`isolate`](Self::isolate)
    pub fn heal(&self, node: NodeId) {
        self.isolated.write().remove(&node);
    }

    /// Current members in id order
    pub fn members(&self) -> Vec<NodeId> {
        self.members.read().keys().copied().collect()
    }

    fn handler(&self, node: NodeId) -> Result<Arc<dyn CommandHandler>> {
        if self.isolated.read().contains(&node) {
            return Err(Error::transport(format!("node {} unreachable", node)));
        }
        self.members
            .read()
            .get(&node)
            .and_then(|slot| slot.as_ref())
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::transport(format!("node {} not attached", node)))
    }

    fn deliver(
        &self,
        from: NodeId,
        recipients: &[NodeId],
        command: &ReplicationCommand,
        mode: DeliveryMode,
    ) -> Result<Vec<(NodeId, CommandReply)>> {
        let mut replies = Vec::with_capacity(recipients.len());
        for &to in recipients {
            let outcome = self
                .handler(to)
                .and_then(|handler| handler.handle(from, command.clone()));
            match (mode, outcome) {
                (DeliveryMode::Asynchronous, Err(e)) => {
                    tracing::debug!(from, to, kind = command.kind(), error = %e, "asynchronous delivery failed");
                }
                (DeliveryMode::Asynchronous, Ok(_)) => {}
                (_, Ok(reply)) => replies.push((to, reply)),
                (_, Err(e)) => return Err(e),
            }
        }
        Ok(replies)
    }
}

/// One node's endpoint on a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    node: NodeId,
    network: Arc<LoopbackNetwork>,
    sent: Mutex<Vec<(&'static str, DeliveryMode)>>,
}

impl LoopbackTransport {
    /// Commands sent so far, as `(kind, mode)`
    pub fn sent(&self) -> Vec<(&'static str, DeliveryMode)> {
        self.sent.lock().clone()
    }

    /// Network this endpoint belongs to
    pub fn network(&self) -> &Arc<LoopbackNetwork> {
        &self.network
    }
}

impl Transport for LoopbackTransport {
    fn local_node(&self) -> NodeId {
        self.node
    }

    fn members(&self) -> Vec<NodeId> {
        self.network.members()
    }

    fn is_coordinator(&self) -> bool {
        self.network.members().first() == Some(&self.node)
    }

    fn broadcast(
        &self,
        command: ReplicationCommand,
        mode: DeliveryMode,
    ) -> Result<Vec<(NodeId, CommandReply)>> {
        self.sent.lock().push((command.kind(), mode));
        let members = self.network.members();
        if mode == DeliveryMode::TotalOrder {
            let _sequence = self.network.sequencer.lock();
            return self.network.deliver(self.node, &members, &command, mode);
        }
        let others: Vec<NodeId> = members.into_iter().filter(|&n| n != self.node).collect();
        self.network.deliver(self.node, &others, &command, mode)
    }

    fn send(
        &self,
        recipients: &[NodeId],
        command: ReplicationCommand,
        mode: DeliveryMode,
        _timeout: Duration,
    ) -> Result<Vec<(NodeId, CommandReply)>> {
        self.sent.lock().push((command.kind(), mode));
        self.network.deliver(self.node, recipients, &command, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{EpochStamp, GlobalTransactionId};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl CommandHandler for Counting {
        fn handle(&self, _from: NodeId, _command: ReplicationCommand) -> Result<CommandReply> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(CommandReply::Ack)
        }
    }

    fn rollback() -> ReplicationCommand {
        ReplicationCommand::Rollback {
            gtx: GlobalTransactionId::new(1, 1),
            stamp: EpochStamp::new(0, "2PC"),
        }
    }

    #[test]
    fn test_broadcast_modes() {
        let network = LoopbackNetwork::new();
        let t1 = network.transport(1);
        let _t2 = network.transport(2);
        let h1 = Arc::new(Counting::default());
        let h2 = Arc::new(Counting::default());
        network.attach(1, h1.clone());
        network.attach(2, h2.clone());

        assert!(t1.is_coordinator());
        let replies = t1.broadcast(rollback(), DeliveryMode::Synchronous).unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(h1.0.load(Ordering::SeqCst), 0);

        let replies = t1.broadcast(rollback(), DeliveryMode::TotalOrder).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(h1.0.load(Ordering::SeqCst), 1);
        assert_eq!(t1.sent().len(), 2);
    }

    #[test]
    fn test_isolated_member_fails_synchronous_delivery() {
        let network = LoopbackNetwork::new();
        let t1 = network.transport(1);
        let _t2 = network.transport(2);
        network.attach(2, Arc::new(Counting::default()));
        network.isolate(2);

        assert!(matches!(
            t1.broadcast(rollback(), DeliveryMode::Synchronous),
            Err(Error::Transport(_))
        ));
        assert!(t1.broadcast(rollback(), DeliveryMode::Asynchronous).unwrap().is_empty());

        network.heal(2);
        assert!(t1.broadcast(rollback(), DeliveryMode::Synchronous).is_ok());
    }

    #[test]
    fn test_dropped_handler_is_not_kept_alive() {
        let network = LoopbackNetwork::new();
        let t1 = network.transport(1);
        let _t2 = network.transport(2);
        network.attach(2, Arc::new(Counting::default()));
        assert!(t1.broadcast(rollback(), DeliveryMode::Synchronous).is_err());
    }
}
