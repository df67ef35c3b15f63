//! Storage container contract
//!
//! The replicated map itself lives outside this crate. The commit applier
//! talks to it through [`DataContainer`]; [`InMemoryDataContainer`] is a
//! multiversion reference implementation used by tests and single-process
//! deployments.

use crate::transaction::{GlobalTransactionId, WriteOp};
use crate::version::{Version, WriteVersion};
use crate::{Error, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

/// Versioned key/value storage
pub trait DataContainer: Send + Sync {
    /// Apply `writer`'s write set at `version`
    fn apply(&self, writer: GlobalTransactionId, write_set: &[WriteOp], version: &WriteVersion) -> Result<()>;

    /// Snapshot read: newest value visible at `snapshot`
    fn get(&self, key: &[u8], snapshot: &Version) -> Option<Bytes>;

    /// Transaction that wrote the value of `key` visible at `snapshot`
    fn writer_at(&self, key: &[u8], snapshot: &Version) -> Option<GlobalTransactionId>;

    /// Version of the newest committed write to `key`
    fn latest_version_of(&self, key: &[u8]) -> Option<Version>;

    /// Transaction of the newest committed write to `key`. Unlike versions,
    /// writer ids are the same on every replica.
    fn latest_writer_of(&self, key: &[u8]) -> Option<GlobalTransactionId>;

    /// Garbage collection hook, called after each applied transaction
    fn notify_committed(&self, _version: &WriteVersion) {}
}

#[derive(Debug, Clone)]
struct VersionedValue {
    version: WriteVersion,
    writer: GlobalTransactionId,
    value: Option<Bytes>,
}

/// Multiversion in-memory container
#[derive(Default)]
pub struct InMemoryDataContainer {
    entries: RwLock<BTreeMap<Bytes, Vec<VersionedValue>>>,
    poisoned: RwLock<HashSet<Bytes>>,
    applied: AtomicU64,
}

impl InMemoryDataContainer {
    /// Create an empty container
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later apply touching `key` fail
    pub fn poison_key(&self, key: impl Into<Bytes>) {
        self.poisoned.write().insert(key.into());
    }

    /// Write sets applied successfully
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Every stored version of `key`, in apply order
    pub fn versions_of(&self, key: &[u8]) -> Vec<WriteVersion> {
        self.entries
            .read()
            .get(key)
            .map(|chain| chain.iter().map(|v| v.version.clone()).collect())
            .unwrap_or_default()
    }

    /// Newest value of `key` regardless of snapshot
    pub fn latest(&self, key: &[u8]) -> Option<Bytes> {
        self.entries
            .read()
            .get(key)
            .and_then(|chain| chain.last())
            .and_then(|v| v.value.clone())
    }
}

impl DataContainer for InMemoryDataContainer {
    fn apply(&self, writer: GlobalTransactionId, write_set: &[WriteOp], version: &WriteVersion) -> Result<()> {
        {
            let poisoned = self.poisoned.read();
            if let Some(op) = write_set.iter().find(|op| poisoned.contains(op.key())) {
                return Err(Error::storage(format!(
                    "apply rejected for key {:?} at {}",
                    op.key(),
                    version.version
                )));
            }
        }

        let mut entries = self.entries.write();
        for op in write_set {
            let value = match op {
                WriteOp::Put { value, .. } => Some(value.clone()),
                WriteOp::Remove { .. } => None,
            };
            entries
                .entry(op.key().clone())
                .or_default()
                .push(VersionedValue {
                    version: version.clone(),
                    writer,
                    value,
                });
        }
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &[u8], snapshot: &Version) -> Option<Bytes> {
        let entries = self.entries.read();
        entries
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.version.version.visible_at(snapshot))
            .and_then(|v| v.value.clone())
    }

    fn writer_at(&self, key: &[u8], snapshot: &Version) -> Option<GlobalTransactionId> {
        let entries = self.entries.read();
        entries
            .get(key)?
            .iter()
            .rev()
            .find(|v| v.version.version.visible_at(snapshot))
            .map(|v| v.writer)
    }

    fn latest_version_of(&self, key: &[u8]) -> Option<Version> {
        self.entries
            .read()
            .get(key)
            .and_then(|chain| chain.last())
            .map(|v| v.version.version.clone())
    }

    fn latest_writer_of(&self, key: &[u8]) -> Option<GlobalTransactionId> {
        self.entries
            .read()
            .get(key)
            .and_then(|chain| chain.last())
            .map(|v| v.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wv(node_seq: u64, sub_version: u32) -> WriteVersion {
        WriteVersion {
            version: Version::from_components([(0, node_seq)]),
            sub_version,
        }
    }

    fn gtx(id: u64) -> GlobalTransactionId {
        GlobalTransactionId::new(0, id)
    }

    fn put(key: &str, value: &str) -> WriteOp {
        WriteOp::Put {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    #[test]
    fn test_snapshot_reads() {
        let container = InMemoryDataContainer::new();
        container.apply(gtx(1), &[put("k", "a")], &wv(1, 0)).unwrap();
        container.apply(gtx(2), &[put("k", "b")], &wv(3, 0)).unwrap();

        let at = |seq| Version::from_components([(0, seq)]);
        assert_eq!(container.get(b"k", &at(0)), None);
        assert_eq!(container.get(b"k", &at(2)), Some(Bytes::from("a")));
        assert_eq!(container.get(b"k", &at(5)), Some(Bytes::from("b")));
        assert_eq!(container.latest_version_of(b"k"), Some(at(3)));
        assert_eq!(container.writer_at(b"k", &at(2)), Some(gtx(1)));
        assert_eq!(container.writer_at(b"k", &at(0)), None);
        assert_eq!(container.latest_writer_of(b"k"), Some(gtx(2)));
    }

    #[test]
    fn test_remove_hides_value() {
        let container = InMemoryDataContainer::new();
        container.apply(gtx(1), &[put("k", "a")], &wv(1, 0)).unwrap();
        container
            .apply(gtx(2), &[WriteOp::Remove { key: Bytes::from("k") }], &wv(2, 0))
            .unwrap();
        assert_eq!(container.latest(b"k"), None);
        assert_eq!(container.versions_of(b"k").len(), 2);
        assert_eq!(container.latest_writer_of(b"k"), Some(gtx(2)));
    }

    #[test]
    fn test_poisoned_key_fails_whole_write_set() {
        let container = InMemoryDataContainer::new();
        container.poison_key("bad");
        let err = container
            .apply(gtx(1), &[put("ok", "1"), put("bad", "2")], &wv(1, 0))
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(container.latest(b"ok"), None);
        assert_eq!(container.applied_count(), 0);
    }
}
