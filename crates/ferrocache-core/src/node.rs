//! Cache node assembly
//!
//! [`CacheNode`] owns one instance of every collaborator a replica needs
//! and wires them together at start-up. Nothing is shared through globals:
//! several nodes can live in one process, which is how the multi-node tests
//! run.

use crate::command::{CommandReply, ReplicationCommand};
use crate::commit_log::CommitLog;
use crate::commit_manager::TransactionCommitManager;
use crate::config::CoreConfig;
use crate::protocol::{
    PassiveReplicationProtocol, ProtocolContext, ReplicationProtocol, TotalOrderProtocol,
    TwoPhaseCommitProtocol,
};
use crate::reconfig::ReconfigurableReplicationManager;
use crate::storage::DataContainer;
use crate::total_order::{SnapshotValidator, TotalOrderManager, build_total_order_manager};
use crate::transaction::{GlobalTransactionId, LocalTransaction};
use crate::transport::{CommandHandler, Transport};
use crate::version::{NodeId, VectorVersionGenerator, VersionGenerator};
use crate::{Error, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One replica of the cache
pub struct CacheNode {
    config: CoreConfig,
    transport: Arc<dyn Transport>,
    commit_log: Arc<CommitLog>,
    commit_manager: Arc<TransactionCommitManager>,
    total_order: Arc<dyn TotalOrderManager>,
    replication: ReconfigurableReplicationManager,
    next_tx: AtomicU64,
    stopped: AtomicBool,
}

impl CacheNode {
    /// Build and boot a node: commit log, version generator, commit
    /// manager and its applier, total order validation, the three
    /// protocols and the replication manager running
    /// `config.default_protocol`.
    pub fn start(
        config: CoreConfig,
        transport: Arc<dyn Transport>,
        container: Arc<dyn DataContainer>,
    ) -> Result<Arc<Self>> {
        config.validate().map_err(Error::config)?;
        let node = config.node_id;
        if transport.local_node() != node {
            return Err(Error::config(format!(
                "transport is bound to node {}, config to node {}",
                transport.local_node(),
                node
            )));
        }

        let commit_log = Arc::new(CommitLog::new(config.commit_log_history));
        let generator: Arc<dyn VersionGenerator> =
            Arc::new(VectorVersionGenerator::new(node, commit_log.clone()));
        let commit_manager = Arc::new(TransactionCommitManager::new(
            commit_log.clone(),
            container,
            generator,
        ));
        commit_manager.start()?;

        let validator = Arc::new(SnapshotValidator::new(commit_manager.clone()));
        let total_order = build_total_order_manager(
            config.total_order_validation,
            node,
            validator.clone(),
            config.validation_workers,
            config.read_set_dependencies,
        )?;

        let ctx = Arc::new(ProtocolContext {
            config: config.clone(),
            transport: transport.clone(),
            commit_manager: commit_manager.clone(),
            validator,
            total_order: total_order.clone(),
        });
        let protocols: Vec<Arc<dyn ReplicationProtocol>> = vec![
            Arc::new(TwoPhaseCommitProtocol::new(ctx.clone())),
            Arc::new(PassiveReplicationProtocol::new(ctx.clone())),
            Arc::new(TotalOrderProtocol::new(ctx)),
        ];
        let initial = protocols
            .iter()
            .find(|p| p.id() == config.default_protocol)
            .cloned()
            .ok_or_else(|| Error::no_such_protocol(&config.default_protocol))?;

        let replication =
            ReconfigurableReplicationManager::new(node, initial.clone(), config.switch_cool_down);
        for protocol in protocols {
            if protocol.id() != initial.id() {
                replication.register_protocol(protocol)?;
            }
        }
        replication.boot()?;

        tracing::info!(
            node,
            protocol = initial.id(),
            validation = ?config.total_order_validation,
            "cache node started"
        );

        Ok(Arc::new(Self {
            config,
            transport,
            commit_log,
            commit_manager,
            total_order,
            replication,
            next_tx: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }))
    }

    /// Begin a local transaction on the latest committed snapshot
    pub fn begin(&self) -> Result<LocalTransaction> {
        self.ensure_running()?;
        let id = self.next_tx.fetch_add(1, Ordering::Relaxed) + 1;
        let gtx = GlobalTransactionId::new(self.config.node_id, id);
        let local = LocalTransaction::new(gtx, self.commit_log.current_version());
        self.replication.start_transaction(&local)?;
        Ok(local)
    }

    /// Read `key` through `tx`: its own buffered writes first, then the
    /// snapshot it began on. The key joins the read set.
    pub fn read(&self, tx: &mut LocalTransaction, key: &[u8]) -> Option<Bytes> {
        if let Some(buffered) = tx.buffered(key) {
            return buffered;
        }
        self.observe(tx, key);
        tx.record_read(Bytes::copy_from_slice(key));
        self.commit_manager.container().get(key, tx.snapshot())
    }

    /// Commit `tx` under the active protocol. Returns once the writes are
    /// applied locally.
    pub fn commit(&self, mut tx: LocalTransaction) -> Result<()> {
        self.ensure_running()?;
        let gtx = tx.gtx();
        let written: Vec<Bytes> = tx.write_set().iter().map(|op| op.key().clone()).collect();
        for key in written {
            self.observe(&mut tx, &key);
        }
        let result = self.replication.commit(&mut tx);
        match &result {
            Ok(()) => tracing::debug!(%gtx, "transaction committed"),
            Err(e) => tracing::debug!(%gtx, error = %e, "transaction failed"),
        }
        result
    }

    /// Inbound delivery entry point
    pub fn handle_remote(&self, from: NodeId, command: ReplicationCommand) -> Result<CommandReply> {
        self.ensure_running()?;
        self.replication.notify_remote_transaction(from, command)
    }

    /// Stop the switch thread, the validation workers and the applier
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.replication.shutdown();
        self.total_order.shutdown();
        self.commit_manager.shutdown();
        tracing::info!(node = self.config.node_id, "cache node stopped");
    }

    /// Whether [`stop`](Self::stop) ran
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// This node
    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    /// Configuration the node started with
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Group communication
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Committed versions
    pub fn commit_log(&self) -> &Arc<CommitLog> {
        &self.commit_log
    }

    /// Local commit manager
    pub fn commit_manager(&self) -> &Arc<TransactionCommitManager> {
        &self.commit_manager
    }

    /// Total order validation
    pub fn total_order(&self) -> &Arc<dyn TotalOrderManager> {
        &self.total_order
    }

    /// Protocol registry and switching
    pub fn replication(&self) -> &ReconfigurableReplicationManager {
        &self.replication
    }

    /// Storage the applier writes to
    pub fn container(&self) -> &Arc<dyn DataContainer> {
        self.commit_manager.container()
    }

    fn observe(&self, tx: &mut LocalTransaction, key: &[u8]) {
        if !tx.has_observed(key) {
            let writer = self.commit_manager.container().writer_at(key, tx.snapshot());
            tx.observe(Bytes::copy_from_slice(key), writer);
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::interrupted(format!(
                "node {} is stopped",
                self.config.node_id
            )));
        }
        Ok(())
    }
}

impl CommandHandler for CacheNode {
    fn handle(&self, from: NodeId, command: ReplicationCommand) -> Result<CommandReply> {
        self.handle_remote(from, command)
    }
}

impl Drop for CacheNode {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{TOTAL_ORDER, TWO_PHASE_COMMIT};
    use crate::storage::InMemoryDataContainer;
    use crate::testing::LoopbackNetwork;

    fn single_node(protocol: &str) -> Arc<CacheNode> {
        let network = LoopbackNetwork::new();
        let transport = network.transport(1);
        let config = CoreConfig::for_node(1).with_default_protocol(protocol);
        let node = CacheNode::start(config, transport, Arc::new(InMemoryDataContainer::new())).unwrap();
        network.attach(1, node.clone());
        node
    }

    #[test]
    fn test_start_rejects_unknown_protocol() {
        let network = LoopbackNetwork::new();
        let config = CoreConfig::for_node(1).with_default_protocol("XA");
        let result = CacheNode::start(config, network.transport(1), Arc::new(InMemoryDataContainer::new()));
        assert!(matches!(result, Err(Error::NoSuchProtocol(_))));
    }

    #[test]
    fn test_start_rejects_mismatched_transport() {
        let network = LoopbackNetwork::new();
        let result = CacheNode::start(
            CoreConfig::for_node(1),
            network.transport(2),
            Arc::new(InMemoryDataContainer::new()),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_read_your_writes() {
        let node = single_node(TWO_PHASE_COMMIT);
        let mut tx = node.begin().unwrap();
        tx.put("k", "v1");
        node.commit(tx).unwrap();

        let mut tx = node.begin().unwrap();
        assert_eq!(node.read(&mut tx, b"k"), Some(Bytes::from("v1")));
        tx.put("k", "v2");
        assert_eq!(node.read(&mut tx, b"k"), Some(Bytes::from("v2")));
        tx.remove("k");
        assert_eq!(node.read(&mut tx, b"k"), None);
    }

    #[test]
    fn test_total_order_single_node() {
        let node = single_node(TOTAL_ORDER);
        let mut tx = node.begin().unwrap();
        tx.put("a", "1");
        node.commit(tx).unwrap();

        let mut reader = node.begin().unwrap();
        assert_eq!(node.read(&mut reader, b"a"), Some(Bytes::from("1")));
    }

    #[test]
    fn test_stopped_node_refuses_work() {
        let node = single_node(TWO_PHASE_COMMIT);
        node.stop();
        assert!(matches!(node.begin(), Err(Error::Interrupted(_))));
    }
}
