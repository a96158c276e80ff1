//! # Transaction Table
//!
//! Recovery's view of transactions. During Analysis the table is rebuilt
//! from the checkpoint snapshot and the log: every transaction whose end
//! record was not found stays `Active` and is flagged *doomed* — it will
//! be rolled back in the Undo pass.
//!
//! ## Transaction States
//!
//! ```text
//! ┌────────┐  freeing-space rec  ┌──────────────┐
//! │ Active │ ──────────────────> │ FreeingSpace │
//! └────────┘                     └──────────────┘
//!     │                                 │
//!     │ end/abort record                │ end record
//!     v                                 v
//! ┌────────┐                        ┌───────┐
//! │ Ended  │ <───────────────────── │  ...  │
//! └────────┘
//! ```
//!
//! `Ended` is irrevocable; Analysis destroys ended entries in its final
//! sweep and everything left must be doomed.
//!
//! ## Concurrency
//!
//! In serial recovery only the recovery thread touches the table. In
//! concurrent mode, Analysis finishes before the table is exposed;
//! afterwards the Undo worker walks a snapshot of the doomed entries while
//! new transactions enter at the head, so the walk and the inserts never
//! observe each other. Destruction of a doomed entry is serialized with
//! itself (one Undo worker).
//!
//! ## Locks
//!
//! The lock manager proper is outside this crate. Transactions carry only
//! the release hook recovery needs: checkpointed transactions in
//! `FreeingSpace`/`Aborting` held locks at the crash, and Analysis /
//! abort release them through [`Transaction::commit_free_locks`].

mod rollback;
mod undo_heap;

pub use rollback::UndoDriver;
pub use undo_heap::{UndoEntry, UndoHeap};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, Result};
use hashbrown::HashMap;
use log::trace;
use parking_lot::{Mutex, RwLock};

use crate::wal::Lsn;

/// Transaction identifier. 0 is never a real transaction.
pub type Tid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XctState {
    Active = 0,
    FreeingSpace = 1,
    Aborting = 2,
    Ended = 3,
}

impl XctState {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            0 => Self::Active,
            1 => Self::FreeingSpace,
            2 => Self::Aborting,
            3 => Self::Ended,
            other => bail!("unknown transaction state {}", other),
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct XctInner {
    state: XctState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    undo_next: Lsn,
}

/// One recovered transaction descriptor.
pub struct Transaction {
    tid: Tid,
    system: bool,
    single_log_sys: bool,
    doomed: bool,
    inner: Mutex<XctInner>,
    /// Lock release hook; empty in commit-lsn recovery.
    locks: Mutex<Vec<u64>>,
}

impl Transaction {
    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    pub fn is_single_log_sys(&self) -> bool {
        self.single_log_sys
    }

    pub fn is_doomed(&self) -> bool {
        self.doomed
    }

    pub fn state(&self) -> XctState {
        self.inner.lock().state
    }

    pub fn change_state(&self, state: XctState) {
        let mut inner = self.inner.lock();
        trace!("txn {}: {:?} -> {:?}", self.tid, inner.state, state);
        inner.state = state;
    }

    pub fn first_lsn(&self) -> Lsn {
        self.inner.lock().first_lsn
    }

    pub fn set_first_lsn(&self, lsn: Lsn) {
        self.inner.lock().first_lsn = lsn;
    }

    pub fn last_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    pub fn set_last_lsn(&self, lsn: Lsn) {
        self.inner.lock().last_lsn = lsn;
    }

    pub fn undo_next(&self) -> Lsn {
        self.inner.lock().undo_next
    }

    pub fn set_undo_next(&self, lsn: Lsn) {
        self.inner.lock().undo_next = lsn;
    }

    /// Release every lock this transaction holds. Recovery calls this for
    /// checkpointed transactions that died in `FreeingSpace`/`Aborting`
    /// and from the abort path.
    pub fn commit_free_locks(&self) {
        let mut locks = self.locks.lock();
        if !locks.is_empty() {
            trace!("txn {}: releasing {} locks", self.tid, locks.len());
            locks.clear();
        }
    }
}

/// Table of transactions known to recovery, keyed by tid.
pub struct TransactionTable {
    /// Insertion order, newest first.
    entries: RwLock<Vec<Arc<Transaction>>>,
    by_tid: RwLock<HashMap<Tid, Arc<Transaction>>>,
    youngest: AtomicU64,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            by_tid: RwLock::new(HashMap::new()),
            youngest: AtomicU64::new(0),
        }
    }

    /// Insert a transaction. A `tid` of 0 allocates a fresh one past the
    /// youngest seen so far (system transactions synthesized by Analysis).
    #[allow(clippy::too_many_arguments)]
    pub fn new_xct(
        &self,
        tid: Tid,
        state: XctState,
        last_lsn: Lsn,
        undo_next: Lsn,
        system: bool,
        single_log_sys: bool,
        doomed: bool,
    ) -> Result<Arc<Transaction>> {
        let tid = if tid == 0 {
            self.youngest.fetch_add(1, Ordering::AcqRel) + 1
        } else {
            tid
        };
        if self.by_tid.read().contains_key(&tid) {
            bail!("transaction {} already exists in the table", tid);
        }

        let txn = Arc::new(Transaction {
            tid,
            system,
            single_log_sys,
            doomed,
            inner: Mutex::new(XctInner {
                state,
                first_lsn: Lsn::NULL,
                last_lsn,
                undo_next,
            }),
            locks: Mutex::new(Vec::new()),
        });

        self.by_tid.write().insert(tid, Arc::clone(&txn));
        self.entries.write().insert(0, Arc::clone(&txn));
        Ok(txn)
    }

    pub fn look_up(&self, tid: Tid) -> Option<Arc<Transaction>> {
        self.by_tid.read().get(&tid).cloned()
    }

    pub fn destroy_xct(&self, tid: Tid) -> Result<()> {
        let removed = self.by_tid.write().remove(&tid);
        if removed.is_none() {
            bail!("cannot destroy unknown transaction {}", tid);
        }
        self.entries.write().retain(|t| t.tid != tid);
        Ok(())
    }

    /// Track the largest tid seen, so tids allocated after recovery do not
    /// collide with pre-crash ones.
    pub fn update_youngest_tid(&self, tid: Tid) {
        self.youngest.fetch_max(tid, Ordering::AcqRel);
    }

    pub fn youngest_tid(&self) -> Tid {
        self.youngest.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.by_tid.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tid.read().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|t| t.state() == XctState::Active)
            .count()
    }

    /// Snapshot of all entries in table order (newest first).
    pub fn snapshot(&self) -> Vec<Arc<Transaction>> {
        self.entries.read().clone()
    }

    /// Doomed transactions still in `Active` state.
    pub fn doomed_snapshot(&self) -> Vec<Arc<Transaction>> {
        self.entries
            .read()
            .iter()
            .filter(|t| t.is_doomed() && t.state() == XctState::Active)
            .cloned()
            .collect()
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}
