//! # Concurrent Restart Tests
//!
//! The system opens after Analysis while Redo and Undo run on the
//! background worker. These tests drive both concurrent redo strategies
//! (log-driven and page-driven) and both undo strategies (reverse and
//! transaction-driven), and check the `commit_lsn` lifecycle: published
//! after Analysis, reset to null once Undo finishes.

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::{tempdir, TempDir};

use fenixdb::checkpoint;
use fenixdb::storage::{PageMut, Volume};
use fenixdb::{
    BufferPool, LogManager, LogRecord, Lsn, OperatingMode, PageId, RedoStrategy, RestartManager,
    RestartOptions, TransactionTable, UndoStrategy, VolumeManager,
};

struct Fixture {
    dir: TempDir,
    vol_path: String,
}

fn setup() -> Fixture {
    let dir = tempdir().unwrap();
    let vol_path = dir.path().join("data.v1").to_string_lossy().into_owned();
    Volume::create(&vol_path, 1, 64).unwrap();
    Fixture { dir, vol_path }
}

impl Fixture {
    fn log_dir(&self) -> PathBuf {
        self.dir.path().join("rlog")
    }

    /// One committed update, one in-flight update, one virgin page.
    /// Returns (committed LSN, in-flight LSN).
    fn seed(&self) -> (Lsn, Lsn) {
        let log = LogManager::create(self.log_dir()).unwrap();
        let volumes = VolumeManager::new();
        volumes.mount(&self.vol_path, 1).unwrap();
        let buffer = BufferPool::new(16);
        let txns = TransactionTable::new();
        checkpoint::synch_take(&log, &buffer, &txns, &volumes).unwrap();

        let committed = log
            .insert(&LogRecord::btree_insert(
                1,
                Lsn::NULL,
                PageId::new(1, 1, 20),
                0,
                vec![0xC0],
            ))
            .unwrap();
        log.insert(&LogRecord::xct_end(1, committed)).unwrap();

        let in_flight = log
            .insert(&LogRecord::btree_insert(
                2,
                Lsn::NULL,
                PageId::new(1, 1, 21),
                0,
                vec![0xF1],
            ))
            .unwrap();
        log.insert(&LogRecord::page_img_format(0, Lsn::NULL, PageId::new(1, 1, 90)))
            .unwrap();
        log.flush_all().unwrap();
        (committed, in_flight)
    }

    fn restart(&self, opts: RestartOptions) -> Engine {
        let log = Arc::new(LogManager::open(self.log_dir()).unwrap());
        let buffer = Arc::new(BufferPool::new(64));
        let txns = Arc::new(TransactionTable::new());
        let volumes = Arc::new(VolumeManager::new());
        let manager = RestartManager::new(
            Arc::clone(&log),
            Arc::clone(&buffer),
            Arc::clone(&txns),
            Arc::clone(&volumes),
            opts,
        )
        .unwrap();
        Engine {
            log,
            buffer,
            txns,
            manager,
        }
    }
}

struct Engine {
    log: Arc<LogManager>,
    buffer: Arc<BufferPool>,
    txns: Arc<TransactionTable>,
    manager: RestartManager,
}

fn run_concurrent(redo: RedoStrategy, undo: UndoStrategy) {
    let fx = setup();
    let (_committed, in_flight) = fx.seed();

    let engine = fx.restart(RestartOptions::concurrent(redo, undo));
    let state = engine.manager.state();
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();

    // Analysis published the admission gate before the background work.
    assert_eq!(outcome.commit_lsn, in_flight);
    assert_eq!(outcome.in_doubt_count, 3);

    engine.manager.join_restart_worker().unwrap();

    assert_eq!(state.mode(), OperatingMode::Forward);
    assert!(state.commit_lsn().is_null(), "gate released after undo");
    assert_eq!(state.in_doubt_count(), 0);
    assert_eq!(engine.buffer.count_in_doubt(), 0);
    assert!(engine.txns.is_empty(), "the loser was rolled back");

    // The pool (not the disk) holds the recovered images in concurrent
    // mode; check the committed page and the rolled-back page there.
    let committed_idx = engine
        .buffer
        .lookup_in_doubt(PageId::new(1, 1, 20).bf_key())
        .unwrap();
    {
        let mut frame = engine.buffer.latch(committed_idx).write();
        let page = PageMut::new(&mut frame);
        assert_eq!(page.body()[0], 0xC0);
    }
    let loser_idx = engine
        .buffer
        .lookup_in_doubt(PageId::new(1, 1, 21).bf_key())
        .unwrap();
    {
        let mut frame = engine.buffer.latch(loser_idx).write();
        let page = PageMut::new(&mut frame);
        assert_eq!(page.body()[0], 0, "in-flight insert undone");
    }
}

#[test]
fn page_driven_redo_with_txn_driven_undo() {
    run_concurrent(RedoStrategy::PageDriven, UndoStrategy::TxnDriven);
}

#[test]
fn page_driven_redo_with_reverse_undo() {
    run_concurrent(RedoStrategy::PageDriven, UndoStrategy::Reverse);
}

#[test]
fn log_driven_redo_with_txn_driven_undo() {
    run_concurrent(RedoStrategy::LogDriven, UndoStrategy::TxnDriven);
}

#[test]
fn illegal_mode_combinations_are_rejected_at_boot() {
    assert!(RestartOptions {
        policy: fenixdb::RestartPolicy::Serial,
        redo: RedoStrategy::PageDriven,
        undo: UndoStrategy::Reverse,
    }
    .validate()
    .is_err());

    assert!(RestartOptions {
        policy: fenixdb::RestartPolicy::ConcurrentCommitLsn,
        redo: RedoStrategy::SprOnDemand,
        undo: UndoStrategy::TxnDriven,
    }
    .validate()
    .is_err());

    assert!(RestartOptions {
        policy: fenixdb::RestartPolicy::ConcurrentLockAcquire,
        redo: RedoStrategy::LogDriven,
        undo: UndoStrategy::Reverse,
    }
    .validate()
    .is_err());
}

#[test]
fn new_transactions_are_admitted_while_the_worker_runs() {
    let fx = setup();
    fx.seed();

    let engine = fx.restart(RestartOptions::concurrent(
        RedoStrategy::PageDriven,
        UndoStrategy::TxnDriven,
    ));
    let state = engine.manager.state();
    engine.manager.recover(engine.log.master_lsn()).unwrap();

    // The system is open: a new transaction enters the table at the head
    // and survives the background undo untouched.
    let newcomer = engine
        .txns
        .new_xct(0, fenixdb::XctState::Active, Lsn::NULL, Lsn::NULL, false, false, false)
        .unwrap();
    assert!(newcomer.tid() > 2, "fresh tid past the recovered ones");

    engine.manager.join_restart_worker().unwrap();

    assert!(state.commit_lsn().is_null());
    let survivor = engine.txns.look_up(newcomer.tid()).unwrap();
    assert_eq!(survivor.state(), fenixdb::XctState::Active);
    assert_eq!(engine.txns.len(), 1, "only the newcomer remains");
}
