//! Shared helpers for the integration tests

#![allow(dead_code)]

use bytes::Bytes;
use ferrocache_core::testing::LoopbackNetwork;
use ferrocache_core::{CacheNode, CoreConfig, Error, InMemoryDataContainer, NodeId, Result};
use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();

const PUT_ATTEMPTS: u32 = 5;

/// Route `tracing` output to the test harness, honoring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// In-process group of nodes sharing one loopback network
pub struct Cluster {
    pub network: Arc<LoopbackNetwork>,
    pub nodes: Vec<Arc<CacheNode>>,
    pub containers: Vec<Arc<InMemoryDataContainer>>,
}

impl Cluster {
    /// Start nodes `1..=size`, each configured by `configure`
    pub fn start(size: u32, configure: impl Fn(CoreConfig) -> CoreConfig) -> Result<Self> {
        init_tracing();
        let network = LoopbackNetwork::new();
        let transports: Vec<_> = (1..=size).map(|id| network.transport(id)).collect();

        let mut nodes = Vec::new();
        let mut containers = Vec::new();
        for (transport, id) in transports.into_iter().zip(1..=size) {
            let container = Arc::new(InMemoryDataContainer::new());
            let config = configure(CoreConfig::for_node(id).with_switch_cool_down(Duration::ZERO));
            let node = CacheNode::start(config, transport, container.clone())?;
            network.attach(id, node.clone());
            nodes.push(node);
            containers.push(container);
        }
        Ok(Self {
            network,
            nodes,
            containers,
        })
    }

    /// Node with id `id`
    pub fn node(&self, id: NodeId) -> &Arc<CacheNode> {
        &self.nodes[(id - 1) as usize]
    }

    /// Commit a single put from node `id`. Replicas release write locks
    /// just after publishing, so an abort is retried a few times on a fresh
    /// transaction.
    pub fn put(&self, id: NodeId, key: &str, value: &str) -> Result<()> {
        let node = self.node(id);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = node.begin()?;
            tx.put(Bytes::copy_from_slice(key.as_bytes()), Bytes::copy_from_slice(value.as_bytes()));
            match node.commit(tx) {
                Err(Error::TransactionAborted(_)) if attempt < PUT_ATTEMPTS => {
                    thread::sleep(Duration::from_millis(10));
                }
                other => return other,
            }
        }
    }

    /// Wait until a fresh snapshot on every node reads `value` under `key`
    pub fn await_replicated(&self, key: &str, value: Option<&str>) -> bool {
        let expected = value.map(|v| Bytes::copy_from_slice(v.as_bytes()));
        wait_until(Duration::from_secs(5), || {
            self.nodes.iter().all(|node| match node.begin() {
                Ok(mut tx) => node.read(&mut tx, key.as_bytes()) == expected,
                Err(_) => false,
            })
        })
    }

    /// Switch every node to `protocol` and wait for each switch
    pub fn switch_all(&self, protocol: &str, stop_the_world: bool) -> Result<()> {
        let handles = self
            .nodes
            .iter()
            .map(|node| node.replication().switch_to(protocol, stop_the_world, false))
            .collect::<Result<Vec<_>>>()?;
        for handle in handles {
            handle.wait()?;
        }
        Ok(())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &self.nodes {
            node.stop();
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
