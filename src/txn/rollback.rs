//! # Rollback and Abort
//!
//! The undo side of recovery: walking a doomed transaction's `undo_next`
//! chain backward, restoring before-images, and emitting compensation
//! records so that a crash *during* recovery re-converges instead of
//! redoing the damage.
//!
//! ```text
//!   undo_next ──> [update C] ──prev──> [update B] ──prev──> [update A]
//!                     │
//!                     v  undo C, log CLR(undo_next = B)
//!   undo_next ──> [update B] ...
//! ```
//!
//! A rollback stops at a floor LSN (exclusive); the reverse-chronological
//! Undo pass uses the second-highest heap key as the floor so that undo
//! interleaves correctly across transactions. `abort` is a rollback to the
//! null floor plus lock release and the abort end record; the caller
//! removes the entry from the table afterwards.
//!
//! Compensation records themselves are never undone. Meeting one in the
//! chain means the crash hit mid-rollback: the walk jumps straight to the
//! record's compensated-to LSN. An undoable compensation record is log
//! corruption and fatal.

use eyre::{bail, ensure, Result};
use log::{debug, trace};

use crate::buffer::BufferPool;
use crate::storage::page::PageMut;
use crate::storage::VolumeManager;
use crate::txn::{Transaction, XctState};
use crate::wal::{LogManager, LogRecord, Lsn, RecordPayload};

/// Borrowed context for rollback work: the log to read and append, the
/// pool holding the pages, the volumes under it.
pub struct UndoDriver<'a> {
    pub log: &'a LogManager,
    pub buffer: &'a BufferPool,
    pub volumes: &'a VolumeManager,
}

impl<'a> UndoDriver<'a> {
    pub fn new(log: &'a LogManager, buffer: &'a BufferPool, volumes: &'a VolumeManager) -> Self {
        Self {
            log,
            buffer,
            volumes,
        }
    }

    /// Roll `txn` back until its `undo_next` is at or below `floor` (or
    /// null). Every undone update emits a CLR.
    pub fn rollback(&self, txn: &Transaction, floor: Lsn) -> Result<()> {
        ensure!(
            txn.state() == XctState::Active,
            "rollback of transaction {} in unexpected state {:?}",
            txn.tid(),
            txn.state()
        );
        trace!(
            "txn {}: rolling back from {} to floor {}",
            txn.tid(),
            txn.undo_next(),
            floor
        );

        loop {
            let undo_next = txn.undo_next();
            if undo_next.is_null() || undo_next <= floor {
                break;
            }

            let record = self.log.fetch(undo_next)?;
            ensure!(
                record.tid == txn.tid(),
                "undo chain of transaction {} reached a record owned by {}",
                txn.tid(),
                record.tid
            );

            if record.is_cpsn() {
                ensure!(
                    !record.is_undo(),
                    "undoable compensation record at {}",
                    record.lsn
                );
                // Jump over everything the pre-crash rollback already
                // compensated.
                match &record.payload {
                    RecordPayload::Compensate { undo_next, .. } => txn.set_undo_next(*undo_next),
                    other => bail!(
                        "compensation record at {} with unexpected payload {:?}",
                        record.lsn,
                        other
                    ),
                }
                continue;
            }

            if !record.is_undo() {
                // Redo-only records (page formats, system work) have
                // nothing to compensate; keep walking the chain.
                txn.set_undo_next(record.prev_lsn);
                continue;
            }

            self.undo_one(txn, &record)?;
            txn.set_undo_next(record.prev_lsn);
        }
        Ok(())
    }

    fn undo_one(&self, txn: &Transaction, record: &LogRecord) -> Result<()> {
        let pid = match record.page_id {
            Some(pid) => pid,
            None => bail!(
                "undoable record at {} carries no page id",
                record.lsn
            ),
        };
        let idx = match self.buffer.lookup_in_doubt(pid.bf_key()) {
            Some(idx) => idx,
            None => bail!(
                "page {} needed by undo of {} is not in the buffer pool",
                pid,
                record.lsn
            ),
        };

        let (offset, before) = match record.before_image() {
            Some((offset, before)) => (offset, before.to_vec()),
            None => bail!("undoable record at {} has no before-image", record.lsn),
        };

        // The CLR is inserted before the page is touched: write-ahead
        // order, the same as forward processing.
        let clr = LogRecord::compensate(
            txn.tid(),
            txn.last_lsn(),
            pid,
            record.prev_lsn,
            offset,
            before,
        );
        let clr_lsn = self.log.insert(&clr)?;
        txn.set_last_lsn(clr_lsn);

        {
            // Blocking acquire: undo runs under the standard transaction
            // rollback rules, not Redo's immediate-timeout discipline.
            let mut frame = self.buffer.latch(idx).write();
            let mut page = PageMut::new(&mut frame);
            record.undo(pid, &mut page)?;
            page.set_lsn(clr_lsn);
            self.buffer.mark_dirty(idx, clr_lsn);
        }
        trace!(
            "txn {}: undid {:?} at {} with CLR {}",
            txn.tid(),
            record.kind,
            record.lsn,
            clr_lsn
        );
        Ok(())
    }

    /// Full abort: roll back everything, release locks, log the abort end
    /// record, mark `Ended`. The caller destroys the table entry.
    pub fn abort(&self, txn: &Transaction) -> Result<()> {
        self.rollback(txn, Lsn::NULL)?;
        txn.commit_free_locks();
        let abort_lsn = self
            .log
            .insert(&LogRecord::xct_abort(txn.tid(), txn.last_lsn()))?;
        txn.set_last_lsn(abort_lsn);
        txn.change_state(XctState::Ended);
        debug!("txn {}: aborted, end record at {}", txn.tid(), abort_lsn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::storage::PageId;
    use crate::txn::TransactionTable;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        log: LogManager,
        buffer: BufferPool,
        volumes: VolumeManager,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let log = LogManager::create(dir.path().join("rlog")).unwrap();
        let volumes = VolumeManager::new();
        volumes
            .mount(&dir.path().join("data.v1").to_string_lossy(), 1)
            .unwrap();
        Fixture {
            _dir: dir,
            log,
            buffer: BufferPool::new(16),
            volumes,
        }
    }

    /// Seed a dirty page in the pool holding `bytes` at body offset 0.
    fn seed_page(fx: &Fixture, pid: PageId, bytes: &[u8], lsn: Lsn) -> usize {
        let mut count = 0u32;
        let idx = fx.buffer.register_and_mark(pid, lsn, &mut count).unwrap();
        {
            let mut frame = fx.buffer.latch(idx).write();
            let mut page = PageMut::new(&mut frame);
            page.format(pid);
            page.write_body(0, bytes).unwrap();
            page.set_lsn(lsn);
        }
        fx.buffer.in_doubt_to_dirty(idx);
        idx
    }

    #[test]
    fn abort_restores_before_images_and_logs_clrs() {
        let fx = fixture();
        let pid = PageId::new(1, 1, 4);
        let table = TransactionTable::new();

        // Forward history: value 1 -> 2 -> 3 on the same bytes.
        let l1 = fx
            .log
            .insert(&LogRecord::btree_update(7, Lsn::NULL, pid, 0, vec![1], vec![2]))
            .unwrap();
        let l2 = fx
            .log
            .insert(&LogRecord::btree_update(7, l1, pid, 0, vec![2], vec![3]))
            .unwrap();
        fx.log.flush_all().unwrap();

        seed_page(&fx, pid, &[3], l2);
        let txn = table
            .new_xct(7, XctState::Active, l2, l2, false, false, true)
            .unwrap();

        let driver = UndoDriver::new(&fx.log, &fx.buffer, &fx.volumes);
        driver.abort(&txn).unwrap();

        assert_eq!(txn.state(), XctState::Ended);
        assert!(txn.undo_next().is_null());

        let idx = fx.buffer.lookup_in_doubt(pid.bf_key()).unwrap();
        {
            let mut frame = fx.buffer.latch(idx).write();
            let page = PageMut::new(&mut frame);
            assert_eq!(page.body()[0], 1, "both updates rolled back");
            assert!(page.lsn() > l2, "page LSN advanced to the last CLR");
        }

        // The log tail: CLR(3->2), CLR(2->1), abort record.
        let mut cursor = fx.log.open_scan(l2, true);
        cursor.next().unwrap(); // the update at l2 itself
        let (_, clr1) = cursor.next().unwrap().unwrap();
        let (_, clr2) = cursor.next().unwrap().unwrap();
        let (_, end) = cursor.next().unwrap().unwrap();
        assert!(clr1.is_cpsn() && clr1.is_redo() && !clr1.is_undo());
        assert!(clr2.is_cpsn());
        assert_eq!(end.kind, crate::wal::RecordKind::XctAbort);
        match &clr2.payload {
            RecordPayload::Compensate { undo_next, .. } => assert!(undo_next.is_null()),
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn rollback_stops_at_the_floor() {
        let fx = fixture();
        let pid = PageId::new(1, 1, 4);
        let table = TransactionTable::new();

        let l1 = fx
            .log
            .insert(&LogRecord::btree_update(7, Lsn::NULL, pid, 0, vec![1], vec![2]))
            .unwrap();
        let l2 = fx
            .log
            .insert(&LogRecord::btree_update(7, l1, pid, 0, vec![2], vec![3]))
            .unwrap();
        fx.log.flush_all().unwrap();

        seed_page(&fx, pid, &[3], l2);
        let txn = table
            .new_xct(7, XctState::Active, l2, l2, false, false, true)
            .unwrap();

        let driver = UndoDriver::new(&fx.log, &fx.buffer, &fx.volumes);
        driver.rollback(&txn, l1).unwrap();

        // Only the l2 update is undone; undo_next now rests on l1.
        assert_eq!(txn.undo_next(), l1);
        let idx = fx.buffer.lookup_in_doubt(pid.bf_key()).unwrap();
        let mut frame = fx.buffer.latch(idx).write();
        let page = PageMut::new(&mut frame);
        assert_eq!(page.body()[0], 2);
    }

    #[test]
    fn chain_with_a_crash_time_clr_skips_compensated_work() {
        let fx = fixture();
        let pid = PageId::new(1, 1, 4);
        let table = TransactionTable::new();

        let l1 = fx
            .log
            .insert(&LogRecord::btree_update(7, Lsn::NULL, pid, 0, vec![1], vec![2]))
            .unwrap();
        let l2 = fx
            .log
            .insert(&LogRecord::btree_update(7, l1, pid, 0, vec![2], vec![3]))
            .unwrap();
        // Pre-crash rollback already compensated l2.
        let clr = fx
            .log
            .insert(&LogRecord::compensate(7, l2, pid, l1, 0, vec![2]))
            .unwrap();
        fx.log.flush_all().unwrap();

        seed_page(&fx, pid, &[2], clr);
        let txn = table
            .new_xct(7, XctState::Active, clr, clr, false, false, true)
            .unwrap();

        let driver = UndoDriver::new(&fx.log, &fx.buffer, &fx.volumes);
        driver.abort(&txn).unwrap();

        let idx = fx.buffer.lookup_in_doubt(pid.bf_key()).unwrap();
        let mut frame = fx.buffer.latch(idx).write();
        let page = PageMut::new(&mut frame);
        assert_eq!(page.body()[0], 1, "only the uncompensated update is undone");
    }
}
