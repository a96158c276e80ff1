//! # Analysis Pass
//!
//! One forward scan from the master checkpoint to the end of the log,
//! rebuilding what the crash destroyed:
//!
//! - the buffer pool's *in-doubt* set — every page some surviving log
//!   record may have to redo, registered without loading it;
//! - the transaction table — every transaction whose end record was not
//!   found stays `Active` and doomed;
//! - the scan anchors: `redo_lsn` (where Redo starts), `undo_lsn` (where
//!   a backward undo scan would stop), `last_lsn` (the pre-crash log
//!   end), and `commit_lsn` (the admission threshold for concurrent
//!   recovery: the earliest LSN any doomed transaction wrote).
//!
//! Only the records belonging to the *master* checkpoint are consumed.
//! A complete checkpoint may follow the master one in the log — the crash
//! can land between hardening a checkpoint-end record and updating the
//! master pointer — and all of its records must be ignored, which the
//! `num_chkpt_end_handled` counter takes care of.
//!
//! Analysis holds the log's insert pause for its whole run: it reads the
//! ground truth and must not move it.

use eyre::{bail, ensure, Result};
use log::{debug, info};

use crate::txn::{Tid, UndoHeap, XctState};
use crate::wal::{LogRecord, Lsn, RecordKind, RecordPayload};

use super::{RestartContext, RestartPolicy};

pub(crate) struct AnalysisOutcome {
    pub redo_lsn: Lsn,
    #[allow(dead_code)]
    pub undo_lsn: Lsn,
    pub last_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub in_doubt_count: u32,
    /// Populated in serial mode only; concurrent undo rebuilds its own.
    pub heap: UndoHeap,
}

pub(crate) fn analysis_pass(ctx: &RestartContext, master: Lsn) -> Result<AnalysisOutcome> {
    let _logging_pause = ctx.log.pause_logging();

    let mut redo_lsn = Lsn::NULL;
    let mut undo_lsn = Lsn::NULL;
    let mut last_lsn = Lsn::NULL;
    let mut in_doubt_count = 0u32;

    if master.is_null() {
        // Brand-new engine: nothing to analyze, nothing to recover.
        debug!("null master, nothing to analyze");
        return Ok(AnalysisOutcome {
            redo_lsn,
            undo_lsn,
            last_lsn,
            commit_lsn: Lsn::NULL,
            in_doubt_count,
            heap: UndoHeap::new(),
        });
    }

    // Sentinel above every assignable LSN; also the initial first_lsn of
    // transactions discovered mid-flight.
    let max_lsn = ctx.log.curr_lsn().advance(1);
    ensure!(master < max_lsn, "master {} is beyond the log end", master);
    let mut commit_lsn = max_lsn;

    let mut cursor = ctx.log.open_scan(master, true);

    // The first record must be the master's begin-checkpoint.
    let last_mount_lsn_before_chkpt;
    match cursor.next()? {
        Some((lsn, record)) if record.kind == RecordKind::ChkptBegin => {
            last_lsn = lsn;
            last_mount_lsn_before_chkpt = match record.payload {
                RecordPayload::ChkptBegin { last_mount_lsn } => last_mount_lsn,
                ref other => bail!("begin-checkpoint with unexpected payload {:?}", other),
            };
            debug!(
                "last mount LSN before checkpoint: {}",
                last_mount_lsn_before_chkpt
            );
        }
        Some((lsn, record)) => bail!(
            "first record of analysis at {} is {:?}, not a begin-checkpoint",
            lsn,
            record.kind
        ),
        None => bail!("master {} points past the end of the log", master),
    }

    // Completed checkpoints handled; only records of the first (master)
    // one are consumed.
    let mut num_chkpt_end_handled = 0u32;
    let mut cur_partition = master.partition();
    let mut mounted_any = false;

    while let Some((lsn, record)) = cursor.next()? {
        if lsn.partition() != cur_partition {
            cur_partition = lsn.partition();
            info!("analyzing log partition {}", cur_partition);
        }
        last_lsn = lsn;

        // Single-log system transactions complete with their one record:
        // synthesize an already-ended entry and handle their page effects.
        if record.is_single_sys_xct() {
            let xd = ctx
                .txns
                .new_xct(0, XctState::Active, lsn, Lsn::NULL, true, true, true)?;
            ensure!(
                !record.is_undo(),
                "system transaction record at {} claims to be undoable",
                lsn
            );
            ensure!(
                record.is_redo(),
                "system transaction record at {} is not redoable",
                lsn
            );

            if record.is_page_alloc() || record.is_page_dealloc() {
                let pid = match record.page_id {
                    Some(pid) => pid,
                    None => bail!("page allocation record at {} without a page id", lsn),
                };
                // The page may have been (de)allocated for a non-logged
                // use; drop its in-doubt status rather than reformat it.
                clear_in_doubt(ctx, pid, record.is_page_alloc(), &mut in_doubt_count);
            } else {
                let pid = match record.page_id {
                    Some(pid) => pid,
                    None => bail!("system transaction record at {} without a page id", lsn),
                };
                let idx = ctx
                    .buffer
                    .register_and_mark(pid, lsn, &mut in_doubt_count)?;
                ctx.buffer.stage_expected_last_write(idx, lsn);

                if record.is_multi_page() {
                    let pid2 = match record.page_id2 {
                        Some(pid) => pid,
                        None => bail!(
                            "multi-page system transaction record at {} without a second page id",
                            lsn
                        ),
                    };
                    let idx2 = ctx
                        .buffer
                        .register_and_mark(pid2, lsn, &mut in_doubt_count)?;
                    ctx.buffer.stage_expected_last_write(idx2, lsn);
                }
            }

            xd.change_state(XctState::Ended);
            continue;
        }

        ensure!(
            !record.is_multi_page(),
            "multi-page record at {} outside a system transaction",
            lsn
        );

        // Transaction-attached records insert the transaction on first
        // sight, doomed until an end record proves otherwise.
        let mut xd = if record.has_tid() {
            ctx.txns.look_up(record.tid)
        } else {
            None
        };
        if record.has_tid()
            && xd.is_none()
            && !matches!(record.kind, RecordKind::Comment | RecordKind::Skip)
        {
            let txn = ctx.txns.new_xct(
                record.tid,
                XctState::Active,
                lsn,
                record.prev_lsn,
                false,
                false,
                true,
            )?;
            ctx.txns.update_youngest_tid(record.tid);
            txn.set_first_lsn(max_lsn);
            xd = Some(txn);
        } else if let Some(txn) = &xd {
            txn.set_last_lsn(lsn);
        }

        match record.kind {
            // A later (incomplete or second complete) checkpoint; its
            // records are ignored via num_chkpt_end_handled.
            RecordKind::ChkptBegin => {}

            RecordKind::ChkptBufTab => {
                if num_chkpt_end_handled == 0 {
                    if let RecordPayload::ChkptBufTab { pages } = &record.payload {
                        debug!("checkpoint buffer table: {} entries", pages.len());
                        for (pid, rec_lsn) in pages {
                            ensure!(
                                !pid.is_null(),
                                "null page id in checkpoint buffer table at {}",
                                lsn
                            );
                            // No expected-last-write staged: the snapshot
                            // knows where dirt began, not where it ended.
                            ctx.buffer
                                .register_and_mark(*pid, *rec_lsn, &mut in_doubt_count)?;
                        }
                    }
                }
            }

            RecordKind::ChkptXctTab => {
                if num_chkpt_end_handled == 0 {
                    if let RecordPayload::ChkptXctTab { youngest, entries } = &record.payload {
                        ctx.txns.update_youngest_tid(*youngest);
                        for entry in entries {
                            restore_checkpointed_xct(ctx, entry.tid, entry)?;
                        }
                    }
                }
            }

            RecordKind::ChkptDevTab => {
                if num_chkpt_end_handled == 0 {
                    if let RecordPayload::ChkptDevTab { devices } = &record.payload {
                        for dev in devices {
                            info!(
                                "device '{}' will be recovered as volume {}",
                                dev.dev_name, dev.vol
                            );
                            ctx.volumes.mount(&dev.dev_name, dev.vol)?;
                            // Preloading the root is a side effect of the
                            // mount; it does not make the root in-doubt.
                            ctx.buffer.preload_root(&ctx.volumes, dev.vol)?;
                            mounted_any = true;
                        }
                    }
                }
            }

            RecordKind::ChkptEnd => {
                if num_chkpt_end_handled == 0 {
                    if let RecordPayload::ChkptEnd {
                        begin_chkpt,
                        min_rec_lsn,
                        min_xct_lsn,
                    } = &record.payload
                    {
                        let (begin_chkpt, min_rec_lsn, min_xct_lsn) =
                            (*begin_chkpt, *min_rec_lsn, *min_xct_lsn);
                        ensure!(
                            begin_chkpt == master,
                            "checkpoint-end at {} names begin {} instead of the master {}",
                            lsn,
                            begin_chkpt,
                            master
                        );
                        redo_lsn = min_rec_lsn;
                        undo_lsn = min_xct_lsn;
                        debug!(
                            "checkpoint end: min_rec_lsn {}, min_xct_lsn {}",
                            min_rec_lsn, min_xct_lsn
                        );
                    }
                }
                num_chkpt_end_handled += 1;
            }

            // Mounts and dismounts below the redo start are applied now so
            // the Redo scan begins with the right volumes mounted; the
            // rest replay inside the Redo scan itself.
            RecordKind::Mount | RecordKind::Dismount => {
                if !redo_lsn.is_null() && lsn < redo_lsn {
                    apply_mount_record(ctx, &record);
                    if record.kind == RecordKind::Mount {
                        mounted_any = true;
                    }
                }
            }

            // A freeing-space transaction finished its user-visible work;
            // recovery treats it as logically complete.
            RecordKind::XctFreeingSpace => {
                let txn = match &xd {
                    Some(txn) => txn,
                    None => bail!("freeing-space record at {} without a transaction", lsn),
                };
                if txn.state() != XctState::Ended {
                    txn.change_state(XctState::Ended);
                }
            }

            RecordKind::XctEndGroup => {
                if let RecordPayload::XctList(tids) = &record.payload {
                    for tid in tids {
                        end_transaction(ctx, *tid, lsn)?;
                    }
                }
            }

            RecordKind::XctEnd | RecordKind::XctAbort => {
                end_transaction(ctx, record.tid, lsn)?;
            }

            RecordKind::Compensate => {
                let txn = match &xd {
                    Some(txn) => txn,
                    None => bail!("compensation record at {} without a transaction", lsn),
                };
                // Compensations are redo-only; an undoable one is log
                // corruption.
                ensure!(
                    !record.is_undo(),
                    "undoable compensation record at {}",
                    lsn
                );
                txn.set_undo_next(Lsn::NULL);
                if record.is_redo() {
                    let pid = match record.page_id {
                        Some(pid) => pid,
                        None => bail!("compensation record at {} without a page id", lsn),
                    };
                    let idx = ctx
                        .buffer
                        .register_and_mark(pid, lsn, &mut in_doubt_count)?;
                    ctx.buffer.stage_expected_last_write(idx, lsn);
                }
            }

            // Store-level metadata; no transaction, no buffered page.
            RecordKind::StoreOperation => {}

            RecordKind::AllocPage
            | RecordKind::DeallocPage
            | RecordKind::PageImgFormat
            | RecordKind::BtreeInsert
            | RecordKind::BtreeUpdate
            | RecordKind::BtreeGhostMark => {
                if record.is_undo() {
                    let txn = match &xd {
                        Some(txn) => txn,
                        None => bail!("undoable record at {} without a transaction", lsn),
                    };
                    txn.set_undo_next(lsn);
                }
                ensure!(record.is_redo(), "update record at {} is not redoable", lsn);

                if record.is_page_alloc() || record.is_page_dealloc() {
                    let pid = match record.page_id {
                        Some(pid) => pid,
                        None => bail!("page allocation record at {} without a page id", lsn),
                    };
                    clear_in_doubt(ctx, pid, record.is_page_alloc(), &mut in_doubt_count);
                } else {
                    let pid = match record.page_id {
                        Some(pid) => pid,
                        None => bail!("update record at {} without a page id", lsn),
                    };
                    let idx = ctx
                        .buffer
                        .register_and_mark(pid, lsn, &mut in_doubt_count)?;
                    ctx.buffer.stage_expected_last_write(idx, lsn);
                }
            }

            RecordKind::Comment | RecordKind::Skip => {}

            RecordKind::BtreeNorecAlloc => {
                // Always a single-log system transaction, handled above.
                bail!(
                    "no-record-allocation record at {} outside a system transaction",
                    lsn
                );
            }
        }

        // Track the earliest LSN of the transaction.
        if record.has_tid() {
            if let Some(txn) = ctx.txns.look_up(record.tid) {
                if lsn < txn.first_lsn() {
                    txn.set_first_lsn(lsn);
                }
            }
        }
    }

    // The forward scan started from a complete checkpoint, so both scan
    // anchors must have been found.
    ensure!(
        !redo_lsn.is_null(),
        "missing redo_lsn at the end of analysis (no checkpoint-end record consumed)"
    );
    ensure!(
        !undo_lsn.is_null(),
        "missing undo_lsn at the end of analysis (no checkpoint-end record consumed)"
    );
    if redo_lsn > master {
        redo_lsn = master;
    }
    if undo_lsn > master {
        undo_lsn = master;
    }

    // Mount/dismount events in (redo_lsn, begin_chkpt] happened after the
    // earliest dirtying record but before the checkpoint snapshotted the
    // device table; invert them so the Redo scan starts from the device
    // state as of redo_lsn and replays them forward itself.
    if in_doubt_count != 0 {
        let mut mount_lsn = last_mount_lsn_before_chkpt;
        while !mount_lsn.is_null() && mount_lsn > redo_lsn {
            let record = ctx.log.fetch(mount_lsn)?;
            ensure!(
                matches!(record.kind, RecordKind::Mount | RecordKind::Dismount),
                "mount chain at {} reached a {:?} record",
                mount_lsn,
                record.kind
            );
            if let Some(dev) = record.device_entry() {
                match record.kind {
                    RecordKind::Dismount => {
                        ctx.volumes.mount_lenient(&dev.dev_name, dev.vol);
                        mounted_any = true;
                    }
                    _ => ctx.volumes.dismount_lenient(dev.vol),
                }
            }
            mount_lsn = record.prev_lsn;
        }
        ctx.volumes.set_last_mount_lsn(mount_lsn);
    } else {
        ctx.volumes.set_last_mount_lsn(last_mount_lsn_before_chkpt);
    }

    // Sweep: ended transactions leave the table, doomed ones feed
    // commit_lsn and (in serial mode) the undo heap.
    let serial = ctx.opts.policy == RestartPolicy::Serial;
    let mut heap_entries = Vec::new();
    for txn in ctx.txns.snapshot() {
        match txn.state() {
            XctState::Active => {
                ensure!(
                    txn.is_doomed(),
                    "active transaction {} not marked doomed at end of analysis",
                    txn.tid()
                );
                let first = txn.first_lsn();
                if !first.is_null() && first < commit_lsn {
                    commit_lsn = first;
                }
                // first_lsn has served its purpose.
                txn.set_first_lsn(Lsn::NULL);
                if serial {
                    heap_entries.push(txn);
                }
            }
            XctState::Ended => {
                ctx.txns.destroy_xct(txn.tid())?;
            }
            other => bail!(
                "transaction {} in state {:?} at end of analysis",
                txn.tid(),
                other
            ),
        }
    }
    let heap = UndoHeap::heapify(heap_entries);
    if commit_lsn == max_lsn {
        commit_lsn = Lsn::NULL;
    }

    if !mounted_any && in_doubt_count != 0 {
        debug!("no device was mounted during analysis; only virgin pages can be redone");
    }
    info!(
        "analysis complete: redo_lsn {}, undo_lsn {}, commit_lsn {}, {} in-doubt pages, {} doomed transactions",
        redo_lsn,
        undo_lsn,
        commit_lsn,
        in_doubt_count,
        ctx.txns.active_count()
    );

    Ok(AnalysisOutcome {
        redo_lsn,
        undo_lsn,
        last_lsn,
        commit_lsn,
        in_doubt_count,
        heap,
    })
}

/// Drop a page's in-doubt status on allocation (`keep_used`) or
/// deallocation (frame released). Unknown pages are a no-op.
fn clear_in_doubt(
    ctx: &RestartContext,
    pid: crate::storage::PageId,
    keep_used: bool,
    in_doubt_count: &mut u32,
) {
    if let Some(idx) = ctx.buffer.lookup_in_doubt(pid.bf_key()) {
        if ctx.buffer.cb(idx).is_in_doubt() {
            ctx.buffer.clear_in_doubt(idx, keep_used);
            debug_assert!(*in_doubt_count > 0);
            *in_doubt_count -= 1;
        }
    }
}

/// Restore one transaction from the checkpoint snapshot. Ended entries in
/// the snapshot are skipped; a transaction whose end record was already
/// scanned stays in the table as `Ended` until the final sweep, which is
/// exactly why the table may already know this tid.
fn restore_checkpointed_xct(
    ctx: &RestartContext,
    tid: Tid,
    entry: &crate::wal::XctTabEntry,
) -> Result<()> {
    if let Some(existing) = ctx.txns.look_up(tid) {
        ensure!(
            matches!(existing.state(), XctState::Active | XctState::Ended),
            "checkpointed transaction {} already in table with state {:?}",
            tid,
            existing.state()
        );
        return Ok(());
    }
    if entry.state == XctState::Ended {
        return Ok(());
    }
    // Checkpoint state is not carried over: anything unfinished is marked
    // active so the standard rollback machinery applies.
    let txn = ctx.txns.new_xct(
        tid,
        XctState::Active,
        entry.last_lsn,
        entry.undo_next,
        false,
        false,
        true,
    )?;
    txn.set_first_lsn(entry.first_lsn);
    debug!(
        "restored checkpointed transaction {}: last {}, undo_next {}, first {}",
        tid, entry.last_lsn, entry.undo_next, entry.first_lsn
    );
    Ok(())
}

/// Process an end/abort for `tid`: release recovery locks if the
/// transaction died mid-commit, then mark it ended. A tid the table does
/// not know ended before the checkpoint; ignore it.
fn end_transaction(ctx: &RestartContext, tid: Tid, lsn: Lsn) -> Result<()> {
    let txn = match ctx.txns.look_up(tid) {
        Some(txn) => txn,
        None => {
            debug!("end record at {} for unknown transaction {}", lsn, tid);
            return Ok(());
        }
    };
    if matches!(
        txn.state(),
        XctState::FreeingSpace | XctState::Aborting
    ) {
        // Locks were re-acquired from the checkpoint for these states;
        // the end record proves they can go.
        txn.commit_free_locks();
    }
    if txn.state() != XctState::Ended {
        txn.change_state(XctState::Ended);
    }
    Ok(())
}

fn apply_mount_record(ctx: &RestartContext, record: &LogRecord) {
    if let Some(dev) = record.device_entry() {
        match record.kind {
            RecordKind::Mount => {
                ctx.volumes.mount_lenient(&dev.dev_name, dev.vol);
                let _ = ctx.buffer.preload_root(&ctx.volumes, dev.vol);
            }
            RecordKind::Dismount => ctx.volumes.dismount_lenient(dev.vol),
            _ => {}
        }
    }
}
