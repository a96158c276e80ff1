//! # Restart Coordinator
//!
//! Sequences the three recovery passes and brackets the phase boundaries
//! with synchronous checkpoints:
//!
//! ```text
//! BeforeRecovery ──> InAnalysis ──> InRedo ──> InUndo ──> Forward
//!                        │
//!                        └── concurrent mode: the system opens here;
//!                            Redo and Undo continue on a worker thread
//! ```
//!
//! In serial mode nothing else runs until recovery completes. In
//! concurrent (commit-LSN) mode, `recover` returns after Analysis and a
//! checkpoint; a background worker performs Redo and Undo while user
//! transactions are admitted against the published `commit_lsn` — any
//! transaction whose first access would conflict below that LSN is the
//! admission layer's problem, not this crate's: the coordinator only
//! computes and publishes the value.
//!
//! The mode matrix (policy × redo strategy × undo strategy) is validated
//! at boot; combinations the engine does not support are rejected before
//! any pass runs.

mod analysis;
mod redo;
mod undo;

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{bail, ensure, Result};
use log::{error, info};
use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::checkpoint;
use crate::storage::VolumeManager;
use crate::txn::TransactionTable;
use crate::wal::{LogManager, Lsn};

/// Where the engine currently is in its restart lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OperatingMode {
    BeforeRecovery = 0,
    InAnalysis = 1,
    InRedo = 2,
    InUndo = 3,
    Forward = 4,
}

impl OperatingMode {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::BeforeRecovery,
            1 => Self::InAnalysis,
            2 => Self::InRedo,
            3 => Self::InUndo,
            _ => Self::Forward,
        }
    }
}

/// How recovery overlaps with the opening of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// The system stays closed until all three passes finish.
    Serial,
    /// Open after Analysis; admission is gated by `commit_lsn`.
    ConcurrentCommitLsn,
    /// Open after Analysis; admission gated by re-acquired locks.
    /// Not implemented; rejected at boot.
    ConcurrentLockAcquire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedoStrategy {
    /// Forward log scan applying records to in-doubt pages.
    LogDriven,
    /// Sweep the buffer pool, repairing each in-doubt page individually.
    PageDriven,
    /// Repair pages on first touch by user transactions. Not implemented.
    SprOnDemand,
    /// Log-driven plus on-demand. Not implemented.
    Mixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoStrategy {
    /// Reverse-chronological across transactions, driven by the undo heap.
    Reverse,
    /// One transaction at a time, in table order.
    TxnDriven,
}

/// The recovery mode matrix. Illegal combinations are rejected by
/// [`RestartOptions::validate`] before recovery starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOptions {
    pub policy: RestartPolicy,
    pub redo: RedoStrategy,
    pub undo: UndoStrategy,
}

impl Default for RestartOptions {
    fn default() -> Self {
        Self {
            policy: RestartPolicy::Serial,
            redo: RedoStrategy::LogDriven,
            undo: UndoStrategy::Reverse,
        }
    }
}

impl RestartOptions {
    pub fn serial() -> Self {
        Self::default()
    }

    pub fn concurrent(redo: RedoStrategy, undo: UndoStrategy) -> Self {
        Self {
            policy: RestartPolicy::ConcurrentCommitLsn,
            redo,
            undo,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.policy {
            RestartPolicy::Serial => {
                ensure!(
                    self.redo == RedoStrategy::LogDriven && self.undo == UndoStrategy::Reverse,
                    "serial recovery supports log-driven redo with reverse undo only"
                );
            }
            RestartPolicy::ConcurrentCommitLsn => {
                ensure!(
                    matches!(self.redo, RedoStrategy::LogDriven | RedoStrategy::PageDriven),
                    "{:?} redo is not implemented",
                    self.redo
                );
            }
            RestartPolicy::ConcurrentLockAcquire => {
                bail!("lock-acquisition concurrent recovery is not implemented");
            }
        }
        Ok(())
    }
}

/// Process-wide recovery state, published read-only after Analysis.
pub struct RecoveryState {
    mode: AtomicU8,
    commit_lsn: AtomicU64,
    redo_lsn: AtomicU64,
    last_lsn: AtomicU64,
    in_doubt_count: AtomicU32,
}

impl RecoveryState {
    fn new() -> Self {
        Self {
            mode: AtomicU8::new(OperatingMode::BeforeRecovery as u8),
            commit_lsn: AtomicU64::new(Lsn::NULL.to_raw()),
            redo_lsn: AtomicU64::new(Lsn::NULL.to_raw()),
            last_lsn: AtomicU64::new(Lsn::NULL.to_raw()),
            in_doubt_count: AtomicU32::new(0),
        }
    }

    pub fn mode(&self) -> OperatingMode {
        OperatingMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub(crate) fn set_mode(&self, mode: OperatingMode) {
        self.mode.store(mode as u8, Ordering::Release);
    }

    /// Admission-control threshold; `NULL` admits everything.
    pub fn commit_lsn(&self) -> Lsn {
        Lsn::from_raw(self.commit_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn set_commit_lsn(&self, lsn: Lsn) {
        self.commit_lsn.store(lsn.to_raw(), Ordering::Release);
    }

    pub fn redo_lsn(&self) -> Lsn {
        Lsn::from_raw(self.redo_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn set_redo_lsn(&self, lsn: Lsn) {
        self.redo_lsn.store(lsn.to_raw(), Ordering::Release);
    }

    /// Last LSN the pre-crash log reached; page-driven Redo repairs
    /// against it when a page's exact last write is unknown.
    pub fn last_lsn(&self) -> Lsn {
        Lsn::from_raw(self.last_lsn.load(Ordering::Acquire))
    }

    pub(crate) fn set_last_lsn(&self, lsn: Lsn) {
        self.last_lsn.store(lsn.to_raw(), Ordering::Release);
    }

    pub fn in_doubt_count(&self) -> u32 {
        self.in_doubt_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_doubt_count(&self, count: u32) {
        self.in_doubt_count.store(count, Ordering::Release);
    }

    pub(crate) fn dec_in_doubt_count(&self) {
        self.in_doubt_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Everything a recovery pass needs, cheap to clone into the worker.
#[derive(Clone)]
pub(crate) struct RestartContext {
    pub log: Arc<LogManager>,
    pub buffer: Arc<BufferPool>,
    pub txns: Arc<TransactionTable>,
    pub volumes: Arc<VolumeManager>,
    pub state: Arc<RecoveryState>,
    pub opts: RestartOptions,
}

impl RestartContext {
    fn synch_checkpoint(&self) -> Result<Lsn> {
        checkpoint::synch_take(&self.log, &self.buffer, &self.txns, &self.volumes)
    }
}

/// Results of `recover`, mirroring what Analysis published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartOutcome {
    pub commit_lsn: Lsn,
    pub redo_lsn: Lsn,
    pub last_lsn: Lsn,
    pub in_doubt_count: u32,
}

pub struct RestartManager {
    ctx: RestartContext,
    worker: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl RestartManager {
    pub fn new(
        log: Arc<LogManager>,
        buffer: Arc<BufferPool>,
        txns: Arc<TransactionTable>,
        volumes: Arc<VolumeManager>,
        opts: RestartOptions,
    ) -> Result<Self> {
        opts.validate()?;
        Ok(Self {
            ctx: RestartContext {
                log,
                buffer,
                txns,
                volumes,
                state: Arc::new(RecoveryState::new()),
                opts,
            },
            worker: Mutex::new(None),
        })
    }

    /// Read-only handle to the published recovery state.
    pub fn state(&self) -> Arc<RecoveryState> {
        Arc::clone(&self.ctx.state)
    }

    /// Run restart recovery from `master` (the begin-checkpoint LSN of the
    /// most recent complete checkpoint; `NULL` on a fresh system).
    ///
    /// Serial policy: all three passes run before this returns. Concurrent
    /// policy: returns after Analysis with a worker thread driving Redo
    /// and Undo; the caller may open the system immediately, gating
    /// admissions on [`RecoveryState::commit_lsn`].
    pub fn recover(&self, master: Lsn) -> Result<RestartOutcome> {
        let ctx = &self.ctx;
        ensure!(
            ctx.state.mode() == OperatingMode::BeforeRecovery,
            "recover() called in mode {:?}",
            ctx.state.mode()
        );
        info!("restart recovery starting from master {}", master);

        // Swizzled pointers cannot coexist with in-doubt frames.
        let org_swizzling = ctx.buffer.swizzling_enabled();
        ctx.buffer.set_swizzling_enabled(false);

        ctx.state.set_mode(OperatingMode::InAnalysis);
        let outcome = analysis::analysis_pass(ctx, master)?;

        ctx.state.set_commit_lsn(outcome.commit_lsn);
        ctx.state.set_redo_lsn(outcome.redo_lsn);
        ctx.state.set_last_lsn(outcome.last_lsn);
        ctx.state.set_in_doubt_count(outcome.in_doubt_count);

        let doomed = ctx.txns.active_count();
        if doomed == 0 && outcome.in_doubt_count == 0 {
            info!("database is clean");
        } else {
            info!(
                "log contains {} in-doubt pages and {} doomed transactions",
                outcome.in_doubt_count, doomed
            );
        }

        ctx.synch_checkpoint()?;

        let result = RestartOutcome {
            commit_lsn: outcome.commit_lsn,
            redo_lsn: outcome.redo_lsn,
            last_lsn: outcome.last_lsn,
            in_doubt_count: outcome.in_doubt_count,
        };

        match ctx.opts.policy {
            RestartPolicy::Serial => {
                let end_logscan_lsn = ctx.log.curr_lsn();

                ctx.state.set_mode(OperatingMode::InRedo);
                if outcome.in_doubt_count != 0 {
                    redo::redo_log_pass(ctx, outcome.redo_lsn, end_logscan_lsn, outcome.in_doubt_count)?;
                    ensure!(
                        ctx.log.curr_lsn() == end_logscan_lsn,
                        "redo generated log records"
                    );
                    ctx.state.set_in_doubt_count(0);
                    // Redo logged nothing, so rec_lsns point at the log
                    // tail while page LSNs sit mid-log; forcing the pool
                    // here both restores that invariant and shortens the
                    // next recovery if we crash again soon.
                    ctx.buffer.force_all(&ctx.volumes)?;
                }

                ctx.state.set_mode(OperatingMode::InUndo);
                let mut heap = outcome.heap;
                if !heap.is_empty() {
                    undo::undo_reverse_pass(ctx, &mut heap)?;
                    // Undo re-dirtied the rolled-back pages; force them so
                    // the closing checkpoint records an empty buffer table
                    // and a re-crash restarts with nothing to do.
                    ctx.buffer.force_all(&ctx.volumes)?;
                }

                ctx.synch_checkpoint()?;
                if org_swizzling {
                    ctx.buffer.set_swizzling_enabled(true);
                }
                ctx.state.set_commit_lsn(Lsn::NULL);
                ctx.state.set_mode(OperatingMode::Forward);
                info!("restart recovery complete");
            }
            RestartPolicy::ConcurrentCommitLsn => {
                // Swizzling stays off for the rest of the run: in-doubt
                // frames survive until the background Redo retires them.
                let worker_ctx = ctx.clone();
                let handle = std::thread::Builder::new()
                    .name("restart-worker".into())
                    .spawn(move || {
                        let result = run_concurrent_passes(&worker_ctx);
                        if let Err(err) = &result {
                            error!("background restart failed: {:#}", err);
                        }
                        result
                    })
                    .map_err(|e| eyre::eyre!("failed to spawn restart worker: {}", e))?;
                *self.worker.lock() = Some(handle);
                info!("analysis complete; redo and undo continue in the background");
            }
            RestartPolicy::ConcurrentLockAcquire => {
                unreachable!("rejected by RestartOptions::validate");
            }
        }

        Ok(result)
    }

    /// Wait for the background worker (concurrent mode). No-op in serial
    /// mode or after the worker has been joined.
    pub fn join_restart_worker(&self) -> Result<()> {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => bail!("restart worker panicked"),
            }
        }
        Ok(())
    }
}

/// Body of the background worker: Redo, checkpoint, Undo, checkpoint.
fn run_concurrent_passes(ctx: &RestartContext) -> Result<()> {
    redo_concurrent(ctx)?;
    undo_concurrent(ctx)?;
    ctx.state.set_mode(OperatingMode::Forward);
    info!("background restart complete");
    Ok(())
}

fn redo_concurrent(ctx: &RestartContext) -> Result<()> {
    ensure!(
        ctx.opts.policy != RestartPolicy::Serial,
        "redo_concurrent is for concurrent recovery only"
    );
    let in_doubt = ctx.state.in_doubt_count();
    if in_doubt != 0 {
        match ctx.opts.redo {
            RedoStrategy::LogDriven => {
                let end_logscan_lsn = ctx.log.curr_lsn();
                redo::redo_log_pass(ctx, ctx.state.redo_lsn(), end_logscan_lsn, in_doubt)?;
                ctx.state.set_in_doubt_count(0);
            }
            RedoStrategy::PageDriven => {
                redo::redo_page_pass(ctx)?;
            }
            other => bail!("{:?} redo is not implemented", other),
        }
    }
    ctx.synch_checkpoint()?;
    Ok(())
}

fn undo_concurrent(ctx: &RestartContext) -> Result<()> {
    ensure!(
        ctx.opts.policy != RestartPolicy::Serial,
        "undo_concurrent is for concurrent recovery only"
    );
    match ctx.opts.undo {
        UndoStrategy::Reverse => {
            // The heap was not kept across the analysis hand-off; rebuild
            // it from the doomed entries in the table.
            let mut heap = crate::txn::UndoHeap::heapify(ctx.txns.doomed_snapshot());
            if !heap.is_empty() {
                undo::undo_reverse_pass(ctx, &mut heap)?;
            }
        }
        UndoStrategy::TxnDriven => {
            undo::undo_txn_pass(ctx)?;
        }
    }
    // Admission control is over.
    ctx.state.set_commit_lsn(Lsn::NULL);
    ctx.synch_checkpoint()?;
    Ok(())
}
