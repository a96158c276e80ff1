//! # Buffer Pool
//!
//! A fixed array of page frames with per-frame control blocks, driven by
//! recovery through the *in-doubt* protocol:
//!
//! ```text
//!              register_and_mark            in_doubt_to_dirty
//!   (absent) ───────────────────> in_doubt ───────────────────> dirty
//!                                    │                            │
//!                                    │ clear_in_doubt             │ force_all
//!                                    v                            v
//!                                used / free                    clean
//! ```
//!
//! During Analysis, pages named by the log are *registered*: a frame is
//! reserved and flagged in-doubt, but no I/O happens. Redo later loads the
//! page image, applies missing updates, and flips in-doubt to dirty. The
//! transition is monotonic; there is no way back to in-doubt.
//!
//! ## Invariants
//!
//! 1. `in_doubt` implies `used`; `in_doubt` and `dirty` are never both set.
//! 2. An in-doubt frame cannot be evicted or repurposed until Redo clears
//!    the flag (there is no eviction during recovery at all).
//! 3. `rec_lsn` on an in-doubt frame only ever decreases
//!    (`register_and_mark` is idempotent and keeps the earliest LSN).
//! 4. The in-doubt → dirty transition happens while the frame's write
//!    latch is held; dropping the latch publishes it.
//!
//! ## Latching
//!
//! The frame's `RwLock` *is* the page latch. Redo acquires it with
//! `try_write()` — the immediate-timeout exclusive acquire: in serial mode
//! no conflict is possible, and in concurrent mode a conflict would mean a
//! user transaction latched an in-doubt page, which invariant 2 forbids,
//! so the caller treats failure as fatal.
//!
//! ## Frame 0
//!
//! Frame 0 is reserved so that index 0 can mean "not found" in lookups,
//! mirroring the free-list convention of the buffer managers this pool is
//! modelled on.

use eyre::{bail, ensure, Result};
use hashbrown::HashMap;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::{PAGE_SIZE, ROOT_PAGE_NO};
use crate::storage::page::PageBuf;
use crate::storage::{PageId, PageReadOutcome, VolumeId, VolumeManager};
use crate::wal::Lsn;

/// Mutable identity and LSN bookkeeping of one frame.
#[derive(Debug, Clone, Copy)]
pub struct CbMeta {
    pub page_id: PageId,
    /// Earliest LSN that may have dirtied the page.
    pub rec_lsn: Lsn,
    /// Latest LSN known to have written the page; staged by Analysis for
    /// page-driven Redo's single-page repair.
    pub expected_last_write: Lsn,
}

impl CbMeta {
    fn empty() -> Self {
        Self {
            page_id: PageId::new(0, 0, 0),
            rec_lsn: Lsn::NULL,
            expected_last_write: Lsn::NULL,
        }
    }
}

/// Per-frame control block.
pub struct ControlBlock {
    in_doubt: AtomicBool,
    dirty: AtomicBool,
    used: AtomicBool,
    meta: Mutex<CbMeta>,
}

impl ControlBlock {
    fn new() -> Self {
        Self {
            in_doubt: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            used: AtomicBool::new(false),
            meta: Mutex::new(CbMeta::empty()),
        }
    }

    pub fn is_in_doubt(&self) -> bool {
        self.in_doubt.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn meta(&self) -> CbMeta {
        *self.meta.lock()
    }

    /// Lower `rec_lsn` to `lsn` if it is earlier than the current value.
    pub fn lower_rec_lsn(&self, lsn: Lsn) {
        let mut meta = self.meta.lock();
        if meta.rec_lsn.is_null() || lsn < meta.rec_lsn {
            meta.rec_lsn = lsn;
        }
    }
}

struct Slot {
    cb: ControlBlock,
    frame: RwLock<Box<PageBuf>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            cb: ControlBlock::new(),
            frame: RwLock::new(Box::new([0u8; PAGE_SIZE])),
        }
    }
}

pub struct BufferPool {
    slots: Vec<Slot>,
    index: RwLock<HashMap<u64, usize>>,
    free: Mutex<Vec<usize>>,
    swizzling: AtomicBool,
}

impl BufferPool {
    /// `frames` includes the reserved frame 0.
    pub fn new(frames: usize) -> Self {
        assert!(frames >= 2, "buffer pool needs at least one usable frame");
        let slots = (0..frames).map(|_| Slot::new()).collect();
        // Hand out low indexes first; frame 0 stays out of the list.
        let free = (1..frames).rev().collect();
        Self {
            slots,
            index: RwLock::new(HashMap::new()),
            free: Mutex::new(free),
            swizzling: AtomicBool::new(true),
        }
    }

    /// Total number of frames, including the reserved frame 0. Page-driven
    /// Redo iterates indexes `1..block_count()`.
    pub fn block_count(&self) -> usize {
        self.slots.len()
    }

    pub fn cb(&self, idx: usize) -> &ControlBlock {
        &self.slots[idx].cb
    }

    /// The page latch of frame `idx`.
    pub fn latch(&self, idx: usize) -> &RwLock<Box<PageBuf>> {
        &self.slots[idx].frame
    }

    /// Pointer swizzling must be off for the whole of recovery: in-doubt
    /// frames hold no page image for swizzled pointers to reference.
    pub fn set_swizzling_enabled(&self, enabled: bool) {
        self.swizzling.store(enabled, Ordering::Release);
    }

    pub fn swizzling_enabled(&self) -> bool {
        self.swizzling.load(Ordering::Acquire)
    }

    /// Find the frame holding `key` (see [`PageId::bf_key`]), registered in
    /// any state. Returns `None` for unknown pages.
    pub fn lookup_in_doubt(&self, key: u64) -> Option<usize> {
        self.index.read().get(&key).copied()
    }

    /// Register `pid` as in-doubt with `lsn` as a candidate `rec_lsn`.
    /// Idempotent: a page already registered keeps the earliest `rec_lsn`
    /// and the latest `expected_last_write`. `in_doubt_count` is bumped
    /// when a frame actually enters the in-doubt state.
    pub fn register_and_mark(
        &self,
        pid: PageId,
        lsn: Lsn,
        in_doubt_count: &mut u32,
    ) -> Result<usize> {
        ensure!(!pid.is_null(), "cannot register the null page id");

        if let Some(idx) = self.lookup_in_doubt(pid.bf_key()) {
            let cb = &self.slots[idx].cb;
            {
                let mut meta = cb.meta.lock();
                if meta.rec_lsn.is_null() || lsn < meta.rec_lsn {
                    meta.rec_lsn = lsn;
                }
            }
            if !cb.in_doubt.swap(true, Ordering::AcqRel) {
                // Previously only `used` (e.g. a preloaded root page).
                *in_doubt_count += 1;
            }
            return Ok(idx);
        }

        let idx = match self.free.lock().pop() {
            Some(idx) => idx,
            // Recovery cannot evict to make room: in-doubt pages are
            // pinned by definition.
            None => bail!(
                "buffer pool exhausted while registering in-doubt page {}",
                pid
            ),
        };

        let cb = &self.slots[idx].cb;
        {
            let mut meta = cb.meta.lock();
            meta.page_id = pid;
            meta.rec_lsn = lsn;
            meta.expected_last_write = Lsn::NULL;
        }
        cb.used.store(true, Ordering::Release);
        cb.dirty.store(false, Ordering::Release);
        cb.in_doubt.store(true, Ordering::Release);
        *in_doubt_count += 1;

        self.index.write().insert(pid.bf_key(), idx);
        Ok(idx)
    }

    /// Clear the in-doubt flag. With `keep_used` the frame stays registered
    /// (page allocation: a format record may follow); without it the frame
    /// is released entirely (page deallocation). The caller owns the
    /// in-doubt counter.
    pub fn clear_in_doubt(&self, idx: usize, keep_used: bool) {
        let cb = &self.slots[idx].cb;
        cb.in_doubt.store(false, Ordering::Release);
        if !keep_used {
            let key = cb.meta.lock().page_id.bf_key();
            cb.used.store(false, Ordering::Release);
            cb.dirty.store(false, Ordering::Release);
            *cb.meta.lock() = CbMeta::empty();
            self.index.write().remove(&key);
            self.free.lock().push(idx);
        }
    }

    /// The monotonic in-doubt → dirty transition. Call with the frame's
    /// write latch held; releasing the latch publishes the transition.
    pub fn in_doubt_to_dirty(&self, idx: usize) {
        let cb = &self.slots[idx].cb;
        cb.in_doubt.store(false, Ordering::Release);
        cb.dirty.store(true, Ordering::Release);
        cb.used.store(true, Ordering::Release);
    }

    /// Record that a log record at `lsn` is known to have written this
    /// page. Analysis stages the running maximum here for every record it
    /// sees touch the page — it becomes the exact repair target for
    /// page-driven Redo. Checkpoint buffer-table entries do *not* stage
    /// one: the snapshot records where a page's dirt began, not where its
    /// writes ended, and a page registered only from the snapshot keeps a
    /// null expectation (repaired against the end of the log instead).
    pub fn stage_expected_last_write(&self, idx: usize, lsn: Lsn) {
        let mut meta = self.slots[idx].cb.meta.lock();
        if lsn > meta.expected_last_write {
            meta.expected_last_write = lsn;
        }
    }

    /// Re-dirty a frame modified after Redo (undo writes land on frames
    /// `force_all` may already have cleaned). `rec_lsn` is adopted only on
    /// the clean → dirty edge; a still-dirty frame keeps its earlier one.
    pub fn mark_dirty(&self, idx: usize, rec_lsn: Lsn) {
        let cb = &self.slots[idx].cb;
        if !cb.dirty.swap(true, Ordering::AcqRel) {
            cb.meta.lock().rec_lsn = rec_lsn;
        }
    }

    /// Load the frame's page image from its volume. The caller holds the
    /// frame's write latch and passes the guarded buffer in.
    pub fn load_for_redo(
        &self,
        volumes: &VolumeManager,
        idx: usize,
        frame: &mut PageBuf,
    ) -> Result<PageReadOutcome> {
        let pid = self.slots[idx].cb.meta.lock().page_id;
        volumes.read_page(pid, frame)
    }

    /// Preload a volume's root page at mount time. The root enters as
    /// `used` only; it becomes in-doubt solely if a later log record
    /// dirties it.
    pub fn preload_root(&self, volumes: &VolumeManager, vol: VolumeId) -> Result<()> {
        let pid = PageId::new(vol, 0, ROOT_PAGE_NO);
        if self.lookup_in_doubt(pid.bf_key()).is_some() {
            return Ok(());
        }
        if !volumes.root_page_exists(vol) {
            return Ok(());
        }

        let idx = match self.free.lock().pop() {
            Some(idx) => idx,
            None => bail!("buffer pool exhausted while preloading root of volume {}", vol),
        };
        {
            let mut frame = self.slots[idx].frame.write();
            let outcome = volumes.read_page(pid, &mut frame)?;
            if outcome != PageReadOutcome::Loaded {
                // Root never flushed or unreadable: Redo will recover it if
                // any log record marks it in-doubt.
                self.free.lock().push(idx);
                return Ok(());
            }
        }
        let cb = &self.slots[idx].cb;
        {
            let mut meta = cb.meta.lock();
            meta.page_id = pid;
            meta.rec_lsn = Lsn::NULL;
            meta.expected_last_write = Lsn::NULL;
        }
        cb.used.store(true, Ordering::Release);
        self.index.write().insert(pid.bf_key(), idx);
        debug!("preloaded root page of volume {} into frame {}", vol, idx);
        Ok(())
    }

    /// Frame index of a volume's root page, if registered.
    pub fn root_page_idx(&self, vol: VolumeId, _store: u32) -> Option<usize> {
        self.lookup_in_doubt(PageId::new(vol, 0, ROOT_PAGE_NO).bf_key())
    }

    /// Number of frames currently flagged in-doubt.
    pub fn count_in_doubt(&self) -> u32 {
        self.slots
            .iter()
            .skip(1)
            .filter(|s| s.cb.is_in_doubt())
            .count() as u32
    }

    /// Number of frames currently flagged dirty.
    pub fn count_dirty(&self) -> u32 {
        self.slots
            .iter()
            .skip(1)
            .filter(|s| s.cb.is_dirty())
            .count() as u32
    }

    /// Snapshot of `(page_id, rec_lsn)` for every in-doubt or dirty frame,
    /// for the checkpoint buffer table.
    pub fn page_table_snapshot(&self) -> Vec<(PageId, Lsn)> {
        let mut entries = Vec::new();
        for slot in self.slots.iter().skip(1) {
            if slot.cb.is_in_doubt() || slot.cb.is_dirty() {
                let meta = slot.cb.meta.lock();
                entries.push((meta.page_id, meta.rec_lsn));
            }
        }
        entries
    }

    /// Write every dirty frame back to its volume and sync, clearing the
    /// dirty flags. A crash after this point restarts with nothing to redo.
    pub fn force_all(&self, volumes: &VolumeManager) -> Result<()> {
        let mut written = 0u32;
        for slot in self.slots.iter().skip(1) {
            if !slot.cb.is_dirty() {
                continue;
            }
            let pid = slot.cb.meta.lock().page_id;
            {
                let frame = slot.frame.read();
                volumes.write_page(pid, &frame)?;
            }
            slot.cb.dirty.store(false, Ordering::Release);
            written += 1;
        }
        volumes.sync_all()?;
        debug!("forced {} dirty pages to disk", written);
        Ok(())
    }
}
