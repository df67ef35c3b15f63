//! No-wait write locks held from prepare until the write is applied

use crate::transaction::GlobalTransactionId;
use crate::{Error, Result};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::BTreeSet;

/// Exclusive per-key ownership. Conflicts fail immediately.
#[derive(Default)]
pub struct KeyLocks {
    owners: DashMap<Bytes, GlobalTransactionId>,
}

impl KeyLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every key for `gtx`, or none of them
    pub fn lock_all(&self, gtx: GlobalTransactionId, keys: &BTreeSet<Bytes>) -> Result<()> {
        let mut acquired = Vec::with_capacity(keys.len());
        for key in keys {
            let conflict = match self.owners.entry(key.clone()) {
                Entry::Occupied(owner) if *owner.get() != gtx => Some(*owner.get()),
                Entry::Occupied(_) => None,
                Entry::Vacant(slot) => {
                    slot.insert(gtx);
                    acquired.push(key.clone());
                    None
                }
            };
            if let Some(owner) = conflict {
                for key in &acquired {
                    self.owners.remove_if(key, |_, o| *o == gtx);
                }
                tracing::debug!(%gtx, %owner, "write lock conflict");
                return Err(Error::aborted(format!("{} conflicts with {}", gtx, owner)));
            }
        }
        Ok(())
    }

    /// Release the keys `gtx` owns among `keys`
    pub fn unlock_all(&self, gtx: GlobalTransactionId, keys: &BTreeSet<Bytes>) {
        for key in keys {
            self.owners.remove_if(key, |_, owner| *owner == gtx);
        }
    }

    /// Keys currently locked
    pub fn locked(&self) -> usize {
        self.owners.len()
    }
}
