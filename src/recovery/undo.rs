//! # Undo Pass
//!
//! Rolls back every doomed transaction, emitting compensation records so
//! the rollback itself survives another crash. Two strategies:
//!
//! - **Reverse-chronological** ([`undo_reverse_pass`]): heap-driven.
//!   Always undo the globally latest undoable record: pop the top
//!   transaction, roll it back down to the heap's second-highest
//!   next-undo LSN, re-push, repeat. No page ever has an earlier record
//!   undone before a later one — undoing a B-tree deletion (which may
//!   split a page) never runs under a later insertion on the same page.
//! - **Transaction-driven** ([`undo_txn_pass`]): concurrent mode. Walk
//!   the doomed entries and run the standard abort per transaction; new
//!   user transactions enter the table at the head and are never visited.
//!
//! Both end by forcing the log, hardening the compensation and abort
//! records.

use eyre::{ensure, Result};
use log::{debug, info, trace};

use crate::txn::{UndoDriver, UndoEntry, UndoHeap, XctState};
use crate::wal::{LogRecord, Lsn};

use super::RestartContext;

/// Heap-driven, strictly reverse-chronological undo.
pub(crate) fn undo_reverse_pass(ctx: &RestartContext, heap: &mut UndoHeap) -> Result<()> {
    if heap.is_empty() {
        debug!("no doomed transaction to undo");
        return Ok(());
    }
    info!("undoing {} doomed transactions", heap.len());
    ctx.log.insert(&LogRecord::comment("restart undo pass"))?;

    let driver = UndoDriver::new(&ctx.log, &ctx.buffer, &ctx.volumes);

    // Interleaved rollback: each step rolls the top transaction back to
    // the runner-up's next-undo LSN, then re-sifts. The top key strictly
    // decreases, so this terminates with every key null (or one
    // transaction left, fully rolled back by its abort below).
    while heap.len() > 1 {
        let top_key = heap.peek_key().unwrap_or(Lsn::NULL);
        if top_key.is_null() {
            break;
        }
        let top = heap.pop().expect("heap is non-empty");

        if top.txn.is_system() {
            // Single-log system transactions are atomic; there is nothing
            // to roll back (multi-log ones do not exist).
            ensure!(
                top.txn.is_single_log_sys(),
                "multi-log system transaction {} in the undo heap",
                top.txn.tid()
            );
            top.txn.set_undo_next(Lsn::NULL);
            heap.push_entry(UndoEntry::new(top.txn));
            continue;
        }

        let floor = heap.peek_key().unwrap_or(Lsn::NULL);
        trace!(
            "undoing transaction {} from {} down to {}",
            top.txn.tid(),
            top_key,
            floor
        );
        driver.rollback(&top.txn, floor)?;
        heap.push_entry(UndoEntry::new(top.txn));
    }

    // Everything is rolled back (or the single remaining transaction will
    // be inside abort); finish each doomed transaction off.
    while let Some(entry) = heap.pop() {
        trace!("aborting transaction {}", entry.txn.tid());
        driver.abort(&entry.txn)?;
        ctx.txns.destroy_xct(entry.txn.tid())?;
    }

    // Harden the compensation and abort records.
    ctx.log.flush_all()?;
    info!("undo complete");
    Ok(())
}

/// Transaction-at-a-time undo over the doomed table entries.
pub(crate) fn undo_txn_pass(ctx: &RestartContext) -> Result<()> {
    let doomed = ctx.txns.doomed_snapshot();
    if doomed.is_empty() {
        debug!("no doomed transaction to undo");
        return Ok(());
    }
    info!("undoing {} doomed transactions", doomed.len());
    ctx.log
        .insert(&LogRecord::comment("restart transaction-driven undo"))?;

    let driver = UndoDriver::new(&ctx.log, &ctx.buffer, &ctx.volumes);
    for txn in doomed {
        if txn.undo_next().is_null() {
            // The last record was a compensation: the pre-crash rollback
            // already finished its work. Just drop the entry.
            txn.change_state(XctState::Ended);
            ctx.txns.destroy_xct(txn.tid())?;
            continue;
        }
        if txn.is_system() {
            ensure!(
                txn.is_single_log_sys(),
                "multi-log system transaction {} among the doomed",
                txn.tid()
            );
            txn.set_undo_next(Lsn::NULL);
            txn.change_state(XctState::Ended);
            ctx.txns.destroy_xct(txn.tid())?;
            continue;
        }

        trace!("aborting transaction {}", txn.tid());
        driver.abort(&txn)?;
        ctx.txns.destroy_xct(txn.tid())?;
    }

    ctx.log.flush_all()?;
    info!("undo complete");
    Ok(())
}
