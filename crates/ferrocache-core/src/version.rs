//! Vector versions
//!
//! Every node keeps one logical counter. A [`Version`] maps node ids to
//! counter values; the commit queue of a node orders transactions by that
//! node's own component, while snapshot visibility uses the full vector.

use crate::commit_log::CommitLog;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Node identity
pub type NodeId = u32;

/// Result of comparing two vector versions component by component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Every component is lower or equal, at least one strictly lower
    Before,
    /// All components equal
    Equal,
    /// Every component is greater or equal, at least one strictly greater
    After,
    /// Some components lower, some greater
    Concurrent,
}

/// A vector version. Missing components read as zero.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    components: BTreeMap<NodeId, u64>,
}

impl Version {
    /// The all-zero version
    pub fn zero() -> Self {
        Self::default()
    }

    /// Build a version from `(node, counter)` pairs
    pub fn from_components(components: impl IntoIterator<Item = (NodeId, u64)>) -> Self {
        let components = components.into_iter().filter(|(_, v)| *v > 0).collect();
        Self { components }
    }

    /// Counter value for `node`
    pub fn get(&self, node: NodeId) -> u64 {
        self.components.get(&node).copied().unwrap_or(0)
    }

    /// Copy of this version with `node`'s component replaced
    pub fn with_component(&self, node: NodeId, value: u64) -> Self {
        let mut next = self.clone();
        if value == 0 {
            next.components.remove(&node);
        } else {
            next.components.insert(node, value);
        }
        next
    }

    /// Component-wise maximum
    pub fn merge(&self, other: &Version) -> Self {
        let mut merged = self.clone();
        for (&node, &value) in &other.components {
            let slot = merged.components.entry(node).or_insert(0);
            *slot = (*slot).max(value);
        }
        merged
    }

    /// Iterate over non-zero components
    pub fn components(&self) -> impl Iterator<Item = (NodeId, u64)> + '_ {
        self.components.iter().map(|(n, v)| (*n, *v))
    }

    /// True when every component is zero
    pub fn is_zero(&self) -> bool {
        self.components.is_empty()
    }

    /// Compare the component owned by `node`. This is the total order used
    /// by a node's commit queue.
    pub fn compare(&self, other: &Version, node: NodeId) -> Ordering {
        self.get(node).cmp(&other.get(node))
    }

    /// Full vector comparison
    pub fn causal_compare(&self, other: &Version) -> CausalOrder {
        let mut less = false;
        let mut greater = false;
        let nodes = self.components.keys().chain(other.components.keys());
        for &node in nodes {
            match self.get(node).cmp(&other.get(node)) {
                Ordering::Less => less = true,
                Ordering::Greater => greater = true,
                Ordering::Equal => {}
            }
        }
        match (less, greater) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// True when a snapshot at `snapshot` can observe data written at `self`
    pub fn visible_at(&self, snapshot: &Version) -> bool {
        matches!(
            self.causal_compare(snapshot),
            CausalOrder::Before | CausalOrder::Equal
        )
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (node, value)) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", node, value)?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Version under which a committed write is stored. The sub-version orders
/// writes that share one commit version on this node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteVersion {
    /// Commit version
    pub version: Version,
    /// Position inside the commit batch
    pub sub_version: u32,
}

/// Version source for one node
pub trait VersionGenerator: Send + Sync {
    /// Node whose counter this generator advances
    fn local_node(&self) -> NodeId;

    /// Most recent committed version visible on this node
    fn current_version(&self) -> Version;

    /// Derive a version from `base` with the local component set to `node_seq`
    fn set_node_version(&self, base: &Version, node_seq: u64) -> Version;

    /// Storage version for a committed transaction
    fn convert_version_to_write(&self, version: &Version, sub_version: u32) -> WriteVersion;

    /// Final commit version from every participant's prepared version
    fn merge_and_max(&self, prepared: &[(NodeId, Version)]) -> Version;
}

/// [`VersionGenerator`] backed by the node's [`CommitLog`]
pub struct VectorVersionGenerator {
    local_node: NodeId,
    commit_log: Arc<CommitLog>,
}

impl VectorVersionGenerator {
    /// Create a generator for `local_node`
    pub fn new(local_node: NodeId, commit_log: Arc<CommitLog>) -> Self {
        Self {
            local_node,
            commit_log,
        }
    }
}

impl VersionGenerator for VectorVersionGenerator {
    fn local_node(&self) -> NodeId {
        self.local_node
    }

    fn current_version(&self) -> Version {
        self.commit_log.current_version()
    }

    fn set_node_version(&self, base: &Version, node_seq: u64) -> Version {
        base.with_component(self.local_node, node_seq)
    }

    fn convert_version_to_write(&self, version: &Version, sub_version: u32) -> WriteVersion {
        WriteVersion {
            version: version.clone(),
            sub_version,
        }
    }

    fn merge_and_max(&self, prepared: &[(NodeId, Version)]) -> Version {
        // Every participant gets the highest prepared counter so the
        // transaction commits at the same scalar on all of them.
        let max_scalar = prepared
            .iter()
            .map(|(node, version)| version.get(*node))
            .max()
            .unwrap_or(0);

        let mut merged = prepared
            .iter()
            .fold(Version::zero(), |acc, (_, version)| acc.merge(version));
        for (node, _) in prepared {
            merged = merged.with_component(*node, max_scalar);
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(pairs: &[(NodeId, u64)]) -> Version {
        Version::from_components(pairs.iter().copied())
    }

    #[test]
    fn test_missing_components_are_zero() {
        let version = v(&[(1, 4)]);
        assert_eq!(version.get(1), 4);
        assert_eq!(version.get(2), 0);
        assert_eq!(v(&[(1, 0)]), Version::zero());
    }

    #[test]
    fn test_causal_compare() {
        let a = v(&[(0, 1), (1, 2)]);
        let b = v(&[(0, 2), (1, 2)]);
        let c = v(&[(0, 3), (1, 1)]);
        assert_eq!(a.causal_compare(&b), CausalOrder::Before);
        assert_eq!(b.causal_compare(&a), CausalOrder::After);
        assert_eq!(a.causal_compare(&a.clone()), CausalOrder::Equal);
        assert_eq!(b.causal_compare(&c), CausalOrder::Concurrent);
        assert!(a.visible_at(&b));
        assert!(!c.visible_at(&b));
    }

    #[test]
    fn test_node_local_compare() {
        let a = v(&[(0, 5), (1, 1)]);
        let b = v(&[(0, 3), (1, 9)]);
        assert_eq!(a.compare(&b, 0), Ordering::Greater);
        assert_eq!(a.compare(&b, 1), Ordering::Less);
    }

    #[test]
    fn test_merge_and_max_unifies_participants() {
        let generator = VectorVersionGenerator::new(0, Arc::new(CommitLog::new(8)));
        let merged = generator.merge_and_max(&[(0, v(&[(0, 3), (2, 1)])), (1, v(&[(1, 7)]))]);
        assert_eq!(merged.get(0), 7);
        assert_eq!(merged.get(1), 7);
        assert_eq!(merged.get(2), 1);
    }

    #[test]
    fn test_debug_format() {
        assert_eq!(format!("{:?}", v(&[(0, 1), (3, 9)])), "[0:1,3:9]");
    }
}
