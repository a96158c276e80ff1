//! # Undo Heap
//!
//! A max-heap of doomed transactions keyed by their next-undo LSN. Undo
//! always rolls back the transaction with the globally latest undoable
//! record, so no page ever sees an earlier record undone before a later
//! one — the ordering that keeps, for example, a B-tree deletion from
//! being undone (possibly splitting a page) under an insertion that
//! happened after it.
//!
//! The key is a *snapshot* of the transaction's `undo_next` taken when the
//! entry is pushed: rolling the top transaction back moves its real
//! `undo_next` below the key, so the driver pops, rolls back, and pushes a
//! refreshed entry — the pop/push pair is the sift-down of a classic
//! replace-top heap.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::txn::Transaction;
use crate::wal::Lsn;

pub struct UndoEntry {
    /// Snapshot of `txn.undo_next()` at push time.
    pub key: Lsn,
    pub txn: Arc<Transaction>,
}

impl UndoEntry {
    pub fn new(txn: Arc<Transaction>) -> Self {
        Self {
            key: txn.undo_next(),
            txn,
        }
    }
}

impl PartialEq for UndoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.txn.tid() == other.txn.tid()
    }
}

impl Eq for UndoEntry {}

impl PartialOrd for UndoEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for UndoEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Tid as a tie-break keeps the order total and deterministic.
        self.key
            .cmp(&other.key)
            .then_with(|| self.txn.tid().cmp(&other.txn.tid()))
    }
}

/// Max-heap over doomed transactions by next-undo LSN.
#[derive(Default)]
pub struct UndoHeap {
    heap: BinaryHeap<UndoEntry>,
}

impl UndoHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    /// Heapify a batch in one go (the Analysis sweep builds the heap this
    /// way instead of pushing one element at a time).
    pub fn heapify(transactions: impl IntoIterator<Item = Arc<Transaction>>) -> Self {
        let entries: Vec<UndoEntry> = transactions.into_iter().map(UndoEntry::new).collect();
        Self {
            heap: BinaryHeap::from(entries),
        }
    }

    pub fn push(&mut self, txn: Arc<Transaction>) {
        self.heap.push(UndoEntry::new(txn));
    }

    pub fn push_entry(&mut self, entry: UndoEntry) {
        self.heap.push(entry);
    }

    pub fn pop(&mut self) -> Option<UndoEntry> {
        self.heap.pop()
    }

    /// Key of the current top, `None` on an empty heap.
    pub fn peek_key(&self) -> Option<Lsn> {
        self.heap.peek().map(|e| e.key)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{TransactionTable, XctState};

    fn doomed(table: &TransactionTable, tid: u64, undo_next: Lsn) -> Arc<Transaction> {
        table
            .new_xct(tid, XctState::Active, undo_next, undo_next, false, false, true)
            .unwrap()
    }

    #[test]
    fn pops_in_descending_undo_order() {
        let table = TransactionTable::new();
        let a = doomed(&table, 1, Lsn::new(1, 100));
        let b = doomed(&table, 2, Lsn::new(1, 300));
        let c = doomed(&table, 3, Lsn::new(1, 200));

        let mut heap = UndoHeap::heapify(vec![a, b, c]);
        assert_eq!(heap.peek_key(), Some(Lsn::new(1, 300)));
        assert_eq!(heap.pop().unwrap().txn.tid(), 2);
        assert_eq!(heap.pop().unwrap().txn.tid(), 3);
        assert_eq!(heap.pop().unwrap().txn.tid(), 1);
        assert!(heap.pop().is_none());
    }

    #[test]
    fn replace_top_reorders_after_rollback() {
        let table = TransactionTable::new();
        let a = doomed(&table, 1, Lsn::new(1, 500));
        let b = doomed(&table, 2, Lsn::new(1, 400));
        let mut heap = UndoHeap::heapify(vec![a.clone(), b]);

        // Rolling `a` back below `b` and refreshing the entry reorders.
        let top = heap.pop().unwrap();
        assert_eq!(top.txn.tid(), 1);
        top.txn.set_undo_next(Lsn::new(1, 100));
        heap.push_entry(UndoEntry::new(top.txn));

        assert_eq!(heap.pop().unwrap().txn.tid(), 2);
        assert_eq!(heap.pop().unwrap().txn.tid(), 1);
    }

    #[test]
    fn null_keys_sink_to_the_bottom() {
        let table = TransactionTable::new();
        let live = doomed(&table, 1, Lsn::new(1, 50));
        let spent = doomed(&table, 2, Lsn::NULL);
        let heap = UndoHeap::heapify(vec![spent, live]);
        assert_eq!(heap.peek_key(), Some(Lsn::new(1, 50)));
    }
}
