//! Sorted transaction queue
//!
//! Pending and committing transactions, ordered by the local component of
//! their current version. The list lives in an index-based arena: slots are
//! stable ids in a growable vector, links are `prev`/`next` ids, and the two
//! sentinels occupy the reserved slots [`HEAD`] and [`TAIL`].
//!
//! ```text
//!   HEAD <-> T2(3,ready) <-> T1(5) <-> T4(5,ready) <-> TAIL
//!            \__ prefix __/
//! ```
//!
//! Ties on the version are kept in arrival order, where a commit counts as
//! arriving again at the final version. The commit applier pulls
//! the ready prefix with [`SortedTransactionQueue::populate_to_commit`];
//! entries are unlinked lazily on the next call, once marked committed.

use crate::transaction::{CacheTransaction, CommitOutcome, GlobalTransactionId, ReplyHandle};
use crate::version::{NodeId, Version};
use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Stable slot id inside the queue arena
pub type SlotId = usize;

/// Reserved slot of the head sentinel
pub const HEAD: SlotId = 0;
/// Reserved slot of the tail sentinel
pub const TAIL: SlotId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryStatus {
    Pending,
    Finished(CommitOutcome),
}

struct EntryState {
    status: EntryStatus,
    reply: Option<ReplyHandle>,
}

/// Queue-side handle of one transaction. Shared with threads waiting for
/// the transaction to be applied.
pub struct TransactionEntry {
    tx: Arc<CacheTransaction>,
    ready: AtomicBool,
    state: Mutex<EntryState>,
    finished: Condvar,
}

impl TransactionEntry {
    fn new(tx: Arc<CacheTransaction>) -> Self {
        Self {
            tx,
            ready: AtomicBool::new(false),
            state: Mutex::new(EntryState {
                status: EntryStatus::Pending,
                reply: None,
            }),
            finished: Condvar::new(),
        }
    }

    /// Transaction id
    pub fn gtx(&self) -> GlobalTransactionId {
        self.tx.gtx()
    }

    /// Wrapped transaction
    pub fn transaction(&self) -> &Arc<CacheTransaction> {
        &self.tx
    }

    /// Current version of the wrapped transaction
    pub fn version(&self) -> Version {
        self.tx.version()
    }

    /// Final version assigned
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Marked committed by the applier
    pub fn is_committed(&self) -> bool {
        self.outcome() == Some(CommitOutcome::Committed)
    }

    /// Outcome, once the entry left the pending state
    pub fn outcome(&self) -> Option<CommitOutcome> {
        match self.state.lock().status {
            EntryStatus::Pending => None,
            EntryStatus::Finished(outcome) => Some(outcome),
        }
    }

    /// Mark applied: wakes blocked waiters and fires a stashed reply
    pub fn committed(&self) {
        self.finish(CommitOutcome::Committed);
    }

    fn finish(&self, outcome: CommitOutcome) {
        let reply = {
            let mut state = self.state.lock();
            if state.status != EntryStatus::Pending {
                return;
            }
            state.status = EntryStatus::Finished(outcome);
            self.finished.notify_all();
            state.reply.take()
        };
        if let Some(reply) = reply {
            reply.send(outcome);
        }
    }

    /// Block the calling thread until the entry leaves the queue
    pub fn wait(&self) -> CommitOutcome {
        let mut state = self.state.lock();
        loop {
            if let EntryStatus::Finished(outcome) = state.status {
                return outcome;
            }
            self.finished.wait(&mut state);
        }
    }

    /// Fire `reply` once the entry leaves the queue, without blocking.
    /// Fires immediately when it already has.
    pub fn on_committed(&self, reply: ReplyHandle) {
        let mut state = self.state.lock();
        let status = state.status;
        match status {
            EntryStatus::Finished(outcome) => {
                drop(state);
                reply.send(outcome);
            }
            EntryStatus::Pending => {
                if state.reply.replace(reply).is_some() {
                    tracing::warn!(gtx = %self.gtx(), "replacing an earlier commit reply handle");
                }
            }
        }
    }
}

impl fmt::Debug for TransactionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionEntry")
            .field("gtx", &self.gtx())
            .field("ready", &self.is_ready())
            .field("outcome", &self.outcome())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sentinel {
    Head,
    Tail,
}

enum SlotKind {
    Sentinel(Sentinel),
    Entry(Arc<TransactionEntry>),
    Free,
}

struct Slot {
    kind: SlotKind,
    prev: SlotId,
    next: SlotId,
    order: u64,
    handed_out: bool,
}

impl Slot {
    fn sentinel(which: Sentinel) -> Self {
        Self {
            kind: SlotKind::Sentinel(which),
            prev: HEAD,
            next: TAIL,
            order: 0,
            handed_out: false,
        }
    }
}

struct QueueInner {
    slots: Vec<Slot>,
    free: Vec<SlotId>,
    index: HashMap<GlobalTransactionId, SlotId>,
    closed: bool,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            slots: vec![Slot::sentinel(Sentinel::Head), Slot::sentinel(Sentinel::Tail)],
            free: Vec::new(),
            index: HashMap::new(),
            closed: false,
        }
    }

    fn entry_at(&self, id: SlotId) -> Result<&Arc<TransactionEntry>> {
        match self.slots.get(id).map(|s| &s.kind) {
            Some(SlotKind::Entry(entry)) => Ok(entry),
            Some(SlotKind::Sentinel(which)) => Err(Error::internal(format!(
                "slot {} is the {:?} sentinel",
                id, which
            ))),
            Some(SlotKind::Free) => Err(Error::internal(format!("slot {} is free", id))),
            None => Err(Error::internal(format!("slot {} out of range", id))),
        }
    }

    fn is_entry(&self, id: SlotId) -> bool {
        matches!(self.slots[id].kind, SlotKind::Entry(_))
    }

    /// Head compares lowest, tail highest
    fn orders_after(&self, id: SlotId, order: u64) -> bool {
        match self.slots[id].kind {
            SlotKind::Sentinel(Sentinel::Head) => false,
            SlotKind::Sentinel(Sentinel::Tail) => true,
            _ => self.slots[id].order > order,
        }
    }

    fn orders_before(&self, id: SlotId, order: u64) -> bool {
        match self.slots[id].kind {
            SlotKind::Sentinel(Sentinel::Head) => true,
            SlotKind::Sentinel(Sentinel::Tail) => false,
            _ => self.slots[id].order < order,
        }
    }

    fn alloc(&mut self, entry: Arc<TransactionEntry>, order: u64) -> SlotId {
        let slot = Slot {
            kind: SlotKind::Entry(entry),
            prev: HEAD,
            next: TAIL,
            order,
            handed_out: false,
        };
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = slot;
                id
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }

    fn link_after(&mut self, id: SlotId, after: SlotId) {
        let next = self.slots[after].next;
        self.slots[id].prev = after;
        self.slots[id].next = next;
        self.slots[after].next = id;
        self.slots[next].prev = id;
    }

    fn unlink(&mut self, id: SlotId) {
        let (prev, next) = (self.slots[id].prev, self.slots[id].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn release(&mut self, id: SlotId) -> Option<Arc<TransactionEntry>> {
        self.unlink(id);
        let slot = std::mem::replace(&mut self.slots[id].kind, SlotKind::Free);
        self.free.push(id);
        match slot {
            SlotKind::Entry(entry) => {
                self.index.remove(&entry.gtx());
                Some(entry)
            }
            _ => None,
        }
    }

    /// Move `id` to its sorted position starting from where it sits now
    fn resort(&mut self, id: SlotId) {
        let order = self.slots[id].order;
        let next = self.slots[id].next;
        let prev = self.slots[id].prev;

        if self.is_entry(next) && self.slots[next].order <= order {
            self.unlink(id);
            let mut cursor = next;
            while !self.orders_after(self.slots[cursor].next, order) {
                cursor = self.slots[cursor].next;
            }
            self.link_after(id, cursor);
        } else if self.is_entry(prev) && self.slots[prev].order > order {
            self.unlink(id);
            let mut cursor = self.slots[prev].prev;
            while self.orders_after(cursor, order) {
                cursor = self.slots[cursor].prev;
            }
            self.link_after(id, cursor);
        }
    }

    fn collect_committed_prefix(&mut self) {
        loop {
            let first = self.slots[HEAD].next;
            let done = match &self.slots[first].kind {
                SlotKind::Entry(entry) => entry.is_committed(),
                _ => false,
            };
            if !done {
                break;
            }
            self.release(first);
        }
    }

    /// Ready run of equal order at the head, or `None` when the applier
    /// has to wait
    fn ready_prefix(&self) -> Option<Vec<SlotId>> {
        let first = self.slots[HEAD].next;
        if !self.is_entry(first) || self.slots[first].handed_out {
            return None;
        }

        let order = self.slots[first].order;
        let mut run = Vec::new();
        let mut cursor = first;
        while self.is_entry(cursor) && self.slots[cursor].order == order {
            let ready = matches!(&self.slots[cursor].kind, SlotKind::Entry(e) if e.is_ready());
            if !ready || self.slots[cursor].handed_out {
                return None;
            }
            run.push(cursor);
            cursor = self.slots[cursor].next;
        }
        Some(run)
    }
}

/// One queue entry as seen by [`SortedTransactionQueue::snapshot`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTransaction {
    /// Transaction id
    pub gtx: GlobalTransactionId,
    /// Local component of its current version
    pub order: u64,
    /// Final version assigned
    pub ready: bool,
}

/// Queue of prepared transactions in local version order
pub struct SortedTransactionQueue {
    node: NodeId,
    inner: Mutex<QueueInner>,
    changed: Condvar,
}

impl SortedTransactionQueue {
    /// Create an empty queue ordering by `node`'s version component
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            inner: Mutex::new(QueueInner::new()),
            changed: Condvar::new(),
        }
    }

    /// Insert `tx` at its provisional version. Scans back from the tail;
    /// ties stay in arrival order. Returns false on duplicate prepare.
    pub fn prepare(&self, tx: Arc<CacheTransaction>) -> bool {
        let gtx = tx.gtx();
        let order = tx.version().get(self.node);

        let mut inner = self.inner.lock();
        if inner.closed {
            tracing::warn!(%gtx, "prepare on a closed queue ignored");
            return false;
        }
        if inner.index.contains_key(&gtx) {
            tracing::warn!(%gtx, "duplicate prepare ignored");
            return false;
        }

        let mut position = inner.slots[TAIL].prev;
        while inner.orders_after(position, order) {
            position = inner.slots[position].prev;
        }

        let id = inner.alloc(Arc::new(TransactionEntry::new(tx)), order);
        inner.link_after(id, position);
        inner.index.insert(gtx, id);
        tracing::trace!(%gtx, order, "transaction queued");
        self.changed.notify_all();
        true
    }

    /// Assign the final version and mark ready. Returns false when the
    /// transaction has no entry here.
    pub fn commit(&self, tx: &CacheTransaction, final_version: &Version) -> Result<bool> {
        let gtx = tx.gtx();
        let order = final_version.get(self.node);

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::interrupted("commit queue closed"));
        }
        let Some(&id) = inner.index.get(&gtx) else {
            return Ok(false);
        };

        let entry = inner.entry_at(id)?.clone();
        entry.transaction().set_version(final_version.clone());
        entry.ready.store(true, Ordering::Release);
        inner.slots[id].order = order;
        inner.resort(id);

        tracing::trace!(%gtx, order, "transaction ready");
        self.changed.notify_all();
        Ok(true)
    }

    /// Unlink and discard the entry of `gtx`. Entries already handed to the
    /// applier are not cancelled; returns whether an entry was removed.
    pub fn rollback(&self, gtx: GlobalTransactionId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let Some(&id) = inner.index.get(&gtx) else {
                return false;
            };
            if inner.slots[id].handed_out {
                tracing::warn!(%gtx, "rollback of a transaction already being applied");
                return false;
            }
            let removed = inner.release(id);
            self.changed.notify_all();
            removed
        };

        match removed {
            Some(entry) => {
                entry.finish(CommitOutcome::RolledBack);
                true
            }
            None => false,
        }
    }

    /// Block until a ready prefix exists and append it to `out`. Drops the
    /// committed prefix left by the previous call first. Fails with
    /// `Interrupted` once the queue is closed.
    pub fn populate_to_commit(&self, out: &mut Vec<Arc<TransactionEntry>>) -> Result<()> {
        let mut inner = self.inner.lock();
        loop {
            if inner.closed {
                return Err(Error::interrupted("commit queue closed"));
            }

            inner.collect_committed_prefix();
            if let Some(run) = inner.ready_prefix() {
                for id in run {
                    inner.slots[id].handed_out = true;
                    out.push(inner.entry_at(id)?.clone());
                }
                return Ok(());
            }

            self.changed.wait(&mut inner);
        }
    }

    /// Close the queue: wake the applier and abandon every queued entry
    pub fn close(&self) {
        let abandoned: Vec<Arc<TransactionEntry>> = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            self.changed.notify_all();
            inner
                .slots
                .iter()
                .filter_map(|slot| match &slot.kind {
                    SlotKind::Entry(entry) => Some(entry.clone()),
                    _ => None,
                })
                .collect()
        };

        if !abandoned.is_empty() {
            tracing::info!(count = abandoned.len(), "abandoning queued transactions");
        }
        for entry in abandoned {
            entry.finish(CommitOutcome::Abandoned);
        }
    }

    /// Whether [`close`](Self::close) was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Entry of `gtx`, if queued
    pub fn get_transaction_entry(&self, gtx: GlobalTransactionId) -> Option<Arc<TransactionEntry>> {
        let inner = self.inner.lock();
        let id = *inner.index.get(&gtx)?;
        inner.entry_at(id).ok().cloned()
    }

    /// Linked entries, committed ones not yet collected included
    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    /// No linked entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries from head to tail
    pub fn snapshot(&self) -> Vec<QueuedTransaction> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.index.len());
        let mut cursor = inner.slots[HEAD].next;
        while let Ok(entry) = inner.entry_at(cursor) {
            out.push(QueuedTransaction {
                gtx: entry.gtx(),
                order: inner.slots[cursor].order,
                ready: entry.is_ready(),
            });
            cursor = inner.slots[cursor].next;
        }
        out
    }

    /// Check that links are consistent and entries are sorted
    pub fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        let mut cursor = HEAD;
        let mut last = 0;
        let mut seen = 0;
        loop {
            let next = inner.slots[cursor].next;
            if inner.slots[next].prev != cursor {
                return false;
            }
            if next == TAIL {
                return seen == inner.index.len();
            }
            if !inner.is_entry(next) || inner.orders_before(next, last) {
                return false;
            }
            last = inner.slots[next].order;
            seen += 1;
            cursor = next;
        }
    }
}

impl fmt::Debug for SortedTransactionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortedTransactionQueue")
            .field("node", &self.node)
            .field("entries", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::EpochStamp;
    use std::thread;
    use std::time::Duration;

    fn tx(id: u64, order: u64) -> Arc<CacheTransaction> {
        let tx = CacheTransaction::without_footprint(
            GlobalTransactionId::new(0, id),
            EpochStamp::new(0, "2PC"),
        );
        tx.set_version(Version::from_components([(0, order)]));
        tx
    }

    fn order(queue: &SortedTransactionQueue) -> Vec<u64> {
        queue.snapshot().iter().map(|q| q.gtx.id).collect()
    }

    fn final_version(order: u64) -> Version {
        Version::from_components([(0, order)])
    }

    #[test]
    fn test_prepare_sorts_by_version() {
        let queue = SortedTransactionQueue::new(0);
        assert!(queue.prepare(tx(1, 5)));
        assert!(queue.prepare(tx(2, 3)));
        assert!(queue.prepare(tx(3, 5)));
        assert_eq!(order(&queue), vec![2, 1, 3]);
        assert!(queue.is_consistent());
    }

    #[test]
    fn test_duplicate_prepare_is_ignored() {
        let queue = SortedTransactionQueue::new(0);
        let t = tx(1, 1);
        assert!(queue.prepare(t.clone()));
        assert!(!queue.prepare(t));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_commit_moves_forward_past_equal_versions() {
        let queue = SortedTransactionQueue::new(0);
        let t1 = tx(1, 1);
        queue.prepare(t1.clone());
        queue.prepare(tx(2, 4));
        queue.prepare(tx(3, 6));
        queue.prepare(tx(4, 9));

        assert!(queue.commit(&t1, &final_version(6)).unwrap());
        assert_eq!(order(&queue), vec![2, 3, 1, 4]);
        assert!(queue.is_consistent());
    }

    #[test]
    fn test_commit_unknown_transaction() {
        let queue = SortedTransactionQueue::new(0);
        assert!(!queue.commit(&tx(9, 1), &final_version(2)).unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_rollback_unlinks_and_reuses_slot() {
        let queue = SortedTransactionQueue::new(0);
        queue.prepare(tx(1, 1));
        let t2 = tx(2, 2);
        queue.prepare(t2.clone());
        let entry = queue.get_transaction_entry(t2.gtx()).unwrap();

        assert!(queue.rollback(t2.gtx()));
        assert!(!queue.rollback(t2.gtx()));
        assert_eq!(entry.outcome(), Some(CommitOutcome::RolledBack));

        queue.prepare(tx(3, 0));
        assert_eq!(order(&queue), vec![3, 1]);
        assert!(queue.is_consistent());
    }

    #[test]
    fn test_populate_stops_at_version_change() {
        let queue = SortedTransactionQueue::new(0);
        let a = tx(1, 2);
        let b = tx(2, 2);
        let c = tx(3, 3);
        for t in [&a, &b, &c] {
            queue.prepare(t.clone());
            queue.commit(t, &t.version()).unwrap();
        }

        let mut out = Vec::new();
        queue.populate_to_commit(&mut out).unwrap();
        assert_eq!(out.iter().map(|e| e.gtx().id).collect::<Vec<_>>(), vec![1, 2]);

        // Handed-out entries cannot be rolled back
        assert!(!queue.rollback(a.gtx()));
        out.iter().for_each(|e| e.committed());

        let mut next = Vec::new();
        queue.populate_to_commit(&mut next).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].gtx().id, 3);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_populate_waits_for_head() {
        let queue = Arc::new(SortedTransactionQueue::new(0));
        let t = tx(1, 1);
        queue.prepare(t.clone());

        let applier = {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut out = Vec::new();
                queue.populate_to_commit(&mut out).map(|_| out.len())
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!applier.is_finished());

        queue.commit(&t, &final_version(1)).unwrap();
        assert_eq!(applier.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_close_interrupts_and_abandons() {
        let queue = Arc::new(SortedTransactionQueue::new(0));
        let t = tx(1, 1);
        queue.prepare(t.clone());
        let entry = queue.get_transaction_entry(t.gtx()).unwrap();

        let applier = {
            let queue = queue.clone();
            thread::spawn(move || queue.populate_to_commit(&mut Vec::new()))
        };
        thread::sleep(Duration::from_millis(20));
        queue.close();

        assert!(matches!(applier.join().unwrap(), Err(Error::Interrupted(_))));
        assert_eq!(entry.wait(), CommitOutcome::Abandoned);
        assert!(!queue.prepare(tx(2, 2)));
    }

    #[test]
    fn test_reply_handle_fires_on_commit() {
        let queue = SortedTransactionQueue::new(0);
        let t = tx(1, 1);
        queue.prepare(t.clone());
        let entry = queue.get_transaction_entry(t.gtx()).unwrap();

        let (reply, rx) = ReplyHandle::channel();
        entry.on_committed(reply);
        assert!(rx.try_recv().is_err());
        entry.committed();
        assert_eq!(rx.try_recv().unwrap(), CommitOutcome::Committed);

        // Late registration fires immediately
        let (late, rx) = ReplyHandle::channel();
        entry.on_committed(late);
        assert_eq!(rx.try_recv().unwrap(), CommitOutcome::Committed);
    }
}
