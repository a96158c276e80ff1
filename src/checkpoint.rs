//! # Synchronous Checkpoints
//!
//! A checkpoint is a record group — begin, device table, buffer table,
//! transaction table, end — followed by a log flush and an atomic update
//! of the persisted master record. Analysis later starts at the master's
//! begin-checkpoint LSN and consumes exactly this group.
//!
//! The device table is written before the buffer table: on replay,
//! volumes must be mounted before any root-page bookkeeping happens.
//!
//! The end record carries `(begin_chkpt, min_rec_lsn, min_xct_lsn)`.
//! When the buffer pool holds no in-doubt/dirty page, or the table no
//! live transaction, the respective minimum falls back to the begin LSN
//! so a later Analysis always finds non-null redo and undo LSNs.
//!
//! Recovery brackets its phases with checkpoints (after Analysis, and
//! after Undo) so that a crash during or right after recovery restarts
//! from the freshest possible position. The master pointer is updated
//! only after the end record is durable; a crash in between leaves the
//! master at the previous checkpoint, which Analysis handles by ignoring
//! the newer, unreferenced checkpoint group.

use eyre::Result;
use log::{debug, info};

use crate::buffer::BufferPool;
use crate::storage::VolumeManager;
use crate::txn::{TransactionTable, XctState};
use crate::wal::{DevEntry, LogManager, LogRecord, Lsn, MasterInfo, XctTabEntry};

/// Take a synchronous checkpoint; returns the begin-checkpoint LSN.
pub fn synch_take(
    log: &LogManager,
    buffer: &BufferPool,
    txns: &TransactionTable,
    volumes: &VolumeManager,
) -> Result<Lsn> {
    let begin_lsn = log.insert(&LogRecord::chkpt_begin(volumes.last_mount_lsn()))?;

    let devices: Vec<DevEntry> = volumes
        .mounted_devices()
        .into_iter()
        .map(|(vol, dev_name)| DevEntry { vol, dev_name })
        .collect();
    log.insert(&LogRecord::chkpt_dev_tab(devices))?;

    let pages = buffer.page_table_snapshot();
    let min_rec_lsn = pages
        .iter()
        .map(|(_, rec_lsn)| *rec_lsn)
        .filter(|lsn| !lsn.is_null())
        .min()
        .unwrap_or(begin_lsn);
    log.insert(&LogRecord::chkpt_buf_tab(pages))?;

    let snapshot = txns.snapshot();
    let entries: Vec<XctTabEntry> = snapshot
        .iter()
        .map(|t| XctTabEntry {
            tid: t.tid(),
            state: t.state(),
            last_lsn: t.last_lsn(),
            first_lsn: t.first_lsn(),
            undo_next: t.undo_next(),
        })
        .collect();
    let min_xct_lsn = snapshot
        .iter()
        .filter(|t| t.state() != XctState::Ended)
        .map(|t| t.first_lsn())
        .filter(|lsn| !lsn.is_null())
        .min()
        .unwrap_or(begin_lsn);
    log.insert(&LogRecord::chkpt_xct_tab(txns.youngest_tid(), entries))?;

    let end_lsn = log.insert(&LogRecord::chkpt_end(begin_lsn, min_rec_lsn, min_xct_lsn))?;
    log.flush_all()?;

    log.set_master(MasterInfo {
        master_lsn: begin_lsn,
        min_rec_lsn,
        min_xct_lsn,
    })?;

    debug!(
        "checkpoint {}..{}: min_rec {}, min_xct {}",
        begin_lsn, end_lsn, min_rec_lsn, min_xct_lsn
    );
    info!("checkpoint complete at {}", begin_lsn);
    Ok(begin_lsn)
}
