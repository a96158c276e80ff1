//! # Redo Pass
//!
//! Repeats history: every update the log knows about that never reached
//! disk is applied to the in-doubt pages Analysis registered, converting
//! them to dirty. Transactions are untouched and nothing is logged —
//! Redo is a pure consumer of the log.
//!
//! Two interchangeable strategies:
//!
//! - **Log-driven** ([`redo_log_pass`]): one forward scan from `redo_lsn`;
//!   each redoable record is applied to its page(s) if the on-page LSN
//!   shows the write was lost. The default, and the only strategy serial
//!   recovery uses.
//! - **Page-driven** ([`redo_page_pass`]): sweep the buffer pool and
//!   repair each in-doubt page individually through single-page repair.
//!   Used by concurrent recovery so pages come back independently while
//!   user transactions run.
//!
//! ## Latch discipline
//!
//! Every page modification happens under the frame's exclusive latch,
//! acquired with an immediate timeout: a conflict is impossible in serial
//! mode and an invariant violation in concurrent mode (user transactions
//! never latch in-doubt pages), so failure to acquire is fatal.

use eyre::{bail, ensure, Result};
use log::{debug, info, trace};

use crate::storage::page::PageMut;
use crate::storage::{PageId, PageReadOutcome};
use crate::txn::XctState;
use crate::wal::{recover_single_page, LogRecord, Lsn, RecordKind};

use super::RestartContext;

/// Forward-scan Redo from `redo_lsn` up to `end_logscan_lsn`.
/// `in_doubt_count` is Analysis's count, re-verified against the number of
/// pages this pass actually converts to dirty.
pub(crate) fn redo_log_pass(
    ctx: &RestartContext,
    redo_lsn: Lsn,
    end_logscan_lsn: Lsn,
    in_doubt_count: u32,
) -> Result<()> {
    if in_doubt_count == 0 {
        return Ok(());
    }
    info!("redoing log from {} to {}", redo_lsn, end_logscan_lsn);

    let serial = ctx.opts.policy == super::RestartPolicy::Serial;
    let mut dirty_count = 0u32;

    let mut cursor = ctx.log.open_scan(redo_lsn, true);
    while let Some((lsn, record)) = cursor.next()? {
        if !serial && lsn >= end_logscan_lsn {
            // Concurrent transactions append while we scan; stop at the
            // log end captured when the pass began.
            break;
        }
        if !record.is_redo() {
            continue;
        }

        match record.page_id {
            None => redo_without_page(ctx, &record, lsn)?,
            Some(pid) => {
                redo_with_page(ctx, &record, lsn, end_logscan_lsn, pid, &mut dirty_count)?;
                if record.is_multi_page() {
                    // Destination first, then the (typically virgin)
                    // second page.
                    let pid2 = match record.page_id2 {
                        Some(pid2) => pid2,
                        None => bail!("multi-page record at {} without a second page id", lsn),
                    };
                    redo_with_page(ctx, &record, lsn, end_logscan_lsn, pid2, &mut dirty_count)?;
                }
            }
        }
    }

    ensure!(
        dirty_count == in_doubt_count,
        "unexpected dirty page count at the end of redo: {} in-doubt, {} made dirty",
        in_doubt_count,
        dirty_count
    );
    info!("redo complete: {} pages recovered", dirty_count);
    Ok(())
}

/// Redoable records with no page attached: device events replay against
/// the mount table, transaction-attached ones only if the transaction is
/// still live.
fn redo_without_page(ctx: &RestartContext, record: &LogRecord, lsn: Lsn) -> Result<()> {
    if record.has_tid() && !record.is_single_sys_xct() {
        match ctx.txns.look_up(record.tid) {
            Some(txn) => {
                ensure!(
                    txn.state() == XctState::Active,
                    "pageless redo at {} for transaction {} in state {:?}",
                    lsn,
                    record.tid,
                    txn.state()
                );
                trace!("pageless redo at {} for transaction {}", lsn, record.tid);
            }
            // Committed or aborted before the crash; its work needs no
            // replay here.
            None => {}
        }
        return Ok(());
    }

    match record.kind {
        RecordKind::Mount | RecordKind::Dismount => {
            if let Some(dev) = record.device_entry() {
                match record.kind {
                    RecordKind::Mount => {
                        ctx.volumes.mount_lenient(&dev.dev_name, dev.vol);
                        ctx.buffer.preload_root(&ctx.volumes, dev.vol)?;
                    }
                    _ => ctx.volumes.dismount_lenient(dev.vol),
                }
            }
            ctx.volumes.set_last_mount_lsn(lsn);
        }
        RecordKind::StoreOperation => {
            trace!("store operation redo at {}", lsn);
        }
        _ => {
            // System work without buffer effect; nothing to apply.
        }
    }
    Ok(())
}

/// Apply one record to one page: the three-way case analysis over the
/// frame's registration state.
fn redo_with_page(
    ctx: &RestartContext,
    record: &LogRecord,
    lsn: Lsn,
    end_logscan_lsn: Lsn,
    pid: PageId,
    dirty_count: &mut u32,
) -> Result<()> {
    ensure!(record.is_redo(), "redo_with_page on a non-redoable record");
    ensure!(
        !ctx.buffer.swizzling_enabled(),
        "redo with pointer swizzling enabled"
    );

    let idx = match ctx.buffer.lookup_in_doubt(pid.bf_key()) {
        Some(idx) => idx,
        None => {
            // Once in-doubt, a page cannot leave the index until Redo
            // clears it; only a deallocated page may be missing.
            if record.is_page_dealloc() {
                return Ok(());
            }
            bail!(
                "page {} for redo at {} is not registered in the buffer pool",
                pid,
                lsn
            );
        }
    };

    let cb = ctx.buffer.cb(idx);
    let mut frame = match ctx.buffer.latch(idx).try_write() {
        Some(frame) => frame,
        None => bail!(
            "unable to acquire the exclusive latch on page {} during redo",
            pid
        ),
    };

    let in_doubt = cb.is_in_doubt();
    let dirty = cb.is_dirty();

    if !in_doubt && !dirty {
        // Registered but clean: a page-allocation whose format is still
        // ahead in the scan, or a preloaded (used) page that is already
        // current.
        if record.is_page_alloc() || cb.is_used() {
            return Ok(());
        }
        bail!(
            "page {} registered with inconsistent flags during redo at {}",
            pid,
            lsn
        );
    }

    // Virgin-producing records need no prior page image: a full format,
    // or the second page of a no-record split.
    let virgin = record.kind == RecordKind::PageImgFormat
        || (record.kind == RecordKind::BtreeNorecAlloc && record.page_id2 == Some(pid));
    let mut corrupted = false;

    if in_doubt && !virgin {
        // First touch: the image must come from disk.
        match ctx.buffer.load_for_redo(&ctx.volumes, idx, &mut frame)? {
            PageReadOutcome::Loaded => {
                trace!("loaded page {} for redo at {}", pid, lsn);
            }
            PageReadOutcome::PastEnd => {
                // Analysis guarantees the first record for a never-flushed
                // page is virgin-producing; reaching here means the log
                // and the volume disagree.
                bail!(
                    "page {} expected on disk during redo at {} does not exist",
                    pid,
                    lsn
                );
            }
            PageReadOutcome::BadChecksum => {
                debug!("page {} corrupted on disk; repairing from the log", pid);
                corrupted = true;
            }
        }
    } else if in_doubt && virgin {
        // Nothing on disk to load; the record itself builds the image.
        frame.fill(0);
    }

    let mut page = PageMut::new(&mut frame);
    let page_lsn = page.lsn();
    let mut redone = false;

    if corrupted {
        // The image is untrusted; rebuild it from nothing up to and
        // including this record. The repair is this record's redo.
        page.format(pid);
        page.set_lsn(Lsn::NULL);
        recover_single_page(&ctx.log, pid, &mut page, lsn, true)?;
        cb.lower_rec_lsn(lsn);
        redone = true;
    } else if page_lsn < lsn {
        // The write at `lsn` never reached this image: repeat it.
        record.redo(pid, &mut page)?;
        page.set_lsn(lsn);
        if in_doubt || virgin {
            cb.lower_rec_lsn(lsn);
        }
        redone = true;
        trace!("redo applied at {} to page {}", lsn, pid);
    } else if virgin {
        // The format itself is the redo.
        cb.lower_rec_lsn(lsn);
        redone = true;
    } else if page_lsn >= end_logscan_lsn && !page_lsn.is_null() {
        bail!(
            "WAL violation: page {} carries LSN {} beyond the log end {}",
            pid,
            page_lsn,
            end_logscan_lsn
        );
    } else {
        // The page already contains this write. Nudge its LSN so the next
        // record for this page still compares correctly.
        if !page_lsn.is_null() {
            page.set_lsn(page_lsn.advance(1));
        }
        trace!("redo skipped at {} for newer page {}", lsn, pid);
    }

    if redone && in_doubt {
        ctx.buffer.in_doubt_to_dirty(idx);
        *dirty_count += 1;
    }
    Ok(())
}

/// Page-driven Redo: sweep every frame, repairing in-doubt pages through
/// single-page repair. Concurrent mode only.
pub(crate) fn redo_page_pass(ctx: &RestartContext) -> Result<()> {
    if ctx.state.in_doubt_count() == 0 {
        debug!("no in-doubt page to redo");
        return Ok(());
    }
    info!(
        "page-driven redo over {} in-doubt pages",
        ctx.state.in_doubt_count()
    );

    let block_count = ctx.buffer.block_count();
    for idx in 1..block_count {
        let cb = ctx.buffer.cb(idx);

        let mut frame = match ctx.buffer.latch(idx).try_write() {
            Some(frame) => frame,
            // In-doubt pages are never latched by user transactions;
            // any conflict here is an invariant violation.
            None => bail!("unable to acquire the exclusive latch on frame {} during redo", idx),
        };
        if !cb.is_in_doubt() {
            continue;
        }

        let meta = cb.meta();
        let pid = meta.page_id;
        match ctx.buffer.lookup_in_doubt(pid.bf_key()) {
            Some(found) if found == idx => {}
            _ => bail!("in-doubt page {} missing from the buffer index", pid),
        }

        // Last write as staged by Analysis; null when only the checkpoint
        // snapshot knew the page, in which case the whole surviving log
        // is the bound.
        let staged_emlsn = meta.expected_last_write;
        let (emlsn, exact) = if staged_emlsn.is_null() {
            (ctx.state.last_lsn(), false)
        } else {
            (staged_emlsn, true)
        };

        match ctx.buffer.load_for_redo(&ctx.volumes, idx, &mut frame)? {
            PageReadOutcome::Loaded => {}
            PageReadOutcome::PastEnd => {
                debug!("page {} is virgin; rebuilding from the log", pid);
                // Buffer already zeroed; on-page LSN reads as null.
            }
            PageReadOutcome::BadChecksum => {
                debug!("page {} corrupted on disk; rebuilding from the log", pid);
                frame.fill(0);
            }
        }

        let mut page = PageMut::new(&mut frame);
        if !(exact && page.lsn() >= emlsn) {
            recover_single_page(&ctx.log, pid, &mut page, emlsn, exact)?;
        }

        cb.lower_rec_lsn(page.lsn());
        ctx.buffer.in_doubt_to_dirty(idx);
        ctx.state.dec_in_doubt_count();
        trace!("page {} recovered to {}", pid, page.lsn());
    }

    ensure!(
        ctx.state.in_doubt_count() == 0,
        "{} in-doubt pages survived page-driven redo",
        ctx.state.in_doubt_count()
    );
    info!("page-driven redo complete");
    Ok(())
}
