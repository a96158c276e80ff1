//! # Restart Recovery Scenarios
//!
//! End-to-end crash/recover tests driving the full three-pass restart:
//! a pre-crash history is written into a real log directory and volume
//! file, everything in memory is dropped (the crash), and a fresh set of
//! components recovers from the persisted master checkpoint.
//!
//! Covered here:
//! - clean database (null master)
//! - committed transaction replay (page made dirty, table left empty)
//! - in-flight transaction rollback (CLR emission, commit_lsn lifecycle)
//! - virgin pages rebuilt purely from the log
//! - multi-page system transaction replay (destination then new child)
//! - the double-checkpoint race (master pointing at the older of two
//!   complete checkpoints)
//! - idempotence: recovering twice converges to the same state

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::{tempdir, TempDir};

use fenixdb::checkpoint;
use fenixdb::config::PAGE_SIZE;
use fenixdb::storage::{PageMut, PageReadOutcome, Volume};
use fenixdb::wal::XctTabEntry;
use fenixdb::{
    BufferPool, LogManager, LogRecord, Lsn, PageId, RestartManager, RestartOptions,
    TransactionTable, VolumeManager, XctState,
};

const VOLUME_PAGES: u32 = 64;

struct Fixture {
    dir: TempDir,
    vol_path: String,
}

fn setup() -> Fixture {
    let dir = tempdir().unwrap();
    let vol_path = dir.path().join("data.v1").to_string_lossy().into_owned();
    Volume::create(&vol_path, 1, VOLUME_PAGES).unwrap();
    Fixture { dir, vol_path }
}

impl Fixture {
    fn log_dir(&self) -> PathBuf {
        self.dir.path().join("rlog")
    }

    /// Start the pre-crash history: fresh log, volume mounted, one
    /// complete checkpoint. Returns the log for further appends.
    fn begin_history(&self) -> LogManager {
        let log = LogManager::create(self.log_dir()).unwrap();
        let volumes = VolumeManager::new();
        volumes.mount(&self.vol_path, 1).unwrap();
        let buffer = BufferPool::new(16);
        let txns = TransactionTable::new();
        checkpoint::synch_take(&log, &buffer, &txns, &volumes).unwrap();
        log
    }

    /// "Reboot": open the log and build fresh components around it.
    fn restart(&self, opts: RestartOptions) -> RecoveredEngine {
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
        RecoveredEngine {
            log,
            buffer,
            txns,
            volumes,
            manager,
        }
    }
}

struct RecoveredEngine {
    log: Arc<LogManager>,
    buffer: Arc<BufferPool>,
    txns: Arc<TransactionTable>,
    #[allow(dead_code)]
    volumes: Arc<VolumeManager>,
    manager: RestartManager,
}

fn read_disk_page(vol_path: &str, page_no: u32) -> (Lsn, [u8; PAGE_SIZE]) {
    let volume = Volume::open(vol_path).unwrap();
    let mut buf = [0u8; PAGE_SIZE];
    let outcome = volume.read_page(page_no, &mut buf).unwrap();
    assert_eq!(outcome, PageReadOutcome::Loaded, "page {} unreadable", page_no);
    let lsn = PageMut::new(&mut buf).lsn();
    (lsn, buf)
}

fn body_at(buf: &[u8; PAGE_SIZE], offset: usize, len: usize) -> &[u8] {
    let start = fenixdb::config::PAGE_HEADER_SIZE + offset;
    &buf[start..start + len]
}

#[test]
fn clean_database_recovers_to_nothing() {
    let fx = setup();
    // No pre-crash history at all: a brand-new log with a null master.
    LogManager::create(fx.log_dir()).unwrap();

    let engine = fx.restart(RestartOptions::serial());
    let master = engine.log.master_lsn();
    assert!(master.is_null());

    let outcome = engine.manager.recover(master).unwrap();
    assert!(outcome.commit_lsn.is_null());
    assert!(outcome.redo_lsn.is_null());
    assert_eq!(outcome.in_doubt_count, 0);
    assert!(engine.txns.is_empty());
    assert_eq!(engine.buffer.count_in_doubt(), 0);
}

#[test]
fn committed_transaction_is_replayed() {
    let fx = setup();
    let pid = PageId::new(1, 1, 42);
    let payload = vec![0xAB, 0xCD, 0xEF, 0x01];

    let insert_lsn;
    {
        let log = fx.begin_history();
        insert_lsn = log
            .insert(&LogRecord::btree_insert(1, Lsn::NULL, pid, 16, payload.clone()))
            .unwrap();
        log.insert(&LogRecord::xct_end(1, insert_lsn)).unwrap();
        log.flush_all().unwrap();
        // Crash: the page never reached disk.
    }

    let engine = fx.restart(RestartOptions::serial());
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();

    assert_eq!(outcome.in_doubt_count, 1);
    assert!(outcome.commit_lsn.is_null(), "no doomed transaction");
    assert!(engine.txns.is_empty(), "committed transaction leaves no entry");
    assert_eq!(engine.buffer.count_in_doubt(), 0);

    // Serial recovery forces the pool, so the replay is on disk.
    let (disk_lsn, buf) = read_disk_page(&fx.vol_path, 42);
    assert_eq!(disk_lsn, insert_lsn);
    assert_eq!(body_at(&buf, 16, 4), payload.as_slice());
}

#[test]
fn in_flight_transaction_is_rolled_back() {
    let fx = setup();
    let pid = PageId::new(1, 1, 42);

    let insert_lsn;
    {
        let log = fx.begin_history();
        insert_lsn = log
            .insert(&LogRecord::btree_insert(1, Lsn::NULL, pid, 16, vec![7, 7, 7]))
            .unwrap();
        log.flush_all().unwrap();
        // Crash with the transaction still in flight.
    }

    let engine = fx.restart(RestartOptions::serial());
    let state = engine.manager.state();
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();

    assert_eq!(outcome.in_doubt_count, 1);
    assert_eq!(
        outcome.commit_lsn, insert_lsn,
        "commit_lsn is the doomed transaction's first LSN"
    );
    assert!(engine.txns.is_empty(), "the loser was rolled back and destroyed");
    assert!(state.commit_lsn().is_null(), "admission gate released");
    assert_eq!(engine.buffer.count_in_doubt(), 0);

    // The insert was undone: the bytes are back to zero and the page
    // carries the CLR's LSN.
    let (disk_lsn, buf) = read_disk_page(&fx.vol_path, 42);
    assert!(disk_lsn > insert_lsn);
    assert_eq!(body_at(&buf, 16, 3), &[0, 0, 0]);

    // The log tail holds the compensation and the abort end record.
    let mut cursor = engine.log.open_scan(insert_lsn, true);
    let mut kinds = Vec::new();
    while let Some((_, record)) = cursor.next().unwrap() {
        kinds.push(record.kind);
    }
    use fenixdb::RecordKind::*;
    assert!(kinds.contains(&Compensate));
    assert!(kinds.contains(&XctAbort));
}

#[test]
fn virgin_page_is_rebuilt_from_the_log() {
    let fx = setup();
    // Page 99 is beyond the volume's 64 pages: it has never existed on
    // disk and its image lives only in the log.
    let pid = PageId::new(1, 1, 99);

    let fmt_lsn;
    {
        let log = fx.begin_history();
        fmt_lsn = log
            .insert(&LogRecord::page_img_format(0, Lsn::NULL, pid))
            .unwrap();
        log.flush_all().unwrap();
    }

    let engine = fx.restart(RestartOptions::serial());
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();
    assert_eq!(outcome.in_doubt_count, 1);

    let (disk_lsn, buf) = read_disk_page(&fx.vol_path, 99);
    assert_eq!(disk_lsn, fmt_lsn);
    let mut buf = buf;
    let page = PageMut::new(&mut buf);
    assert_eq!(page.page_no(), 99);
}

#[test]
fn multi_page_system_transaction_replays_both_pages() {
    let fx = setup();
    let dest = PageId::new(1, 1, 5);
    let child = PageId::new(1, 1, 70); // beyond the volume: virgin

    let split_lsn;
    {
        let log = fx.begin_history();
        split_lsn = log
            .insert(&LogRecord::btree_norec_alloc(dest, child, 8, vec![0x11, 0x22]))
            .unwrap();
        log.flush_all().unwrap();
    }

    let engine = fx.restart(RestartOptions::serial());
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();
    assert_eq!(outcome.in_doubt_count, 2, "both pages were in doubt");
    assert!(engine.txns.is_empty(), "system transactions never reach undo");

    let (dest_lsn, dest_buf) = read_disk_page(&fx.vol_path, 5);
    assert_eq!(dest_lsn, split_lsn);
    assert_eq!(body_at(&dest_buf, 8, 2), &[0x11, 0x22]);

    let (child_lsn, child_buf) = read_disk_page(&fx.vol_path, 70);
    assert_eq!(child_lsn, split_lsn);
    let mut child_buf = child_buf;
    assert_eq!(PageMut::new(&mut child_buf).page_no(), 70);
}

#[test]
fn second_complete_checkpoint_without_master_update_is_ignored() {
    let fx = setup();
    let pid = PageId::new(1, 1, 42);

    {
        let log = fx.begin_history();
        let l1 = log
            .insert(&LogRecord::btree_insert(1, Lsn::NULL, pid, 0, vec![5]))
            .unwrap();
        log.insert(&LogRecord::xct_end(1, l1)).unwrap();

        // A second complete checkpoint whose end record was hardened but
        // whose master pointer update never happened. Its tables are
        // poisoned: consuming them would resurrect transaction 9 and an
        // extra in-doubt page.
        let begin2 = log.insert(&LogRecord::chkpt_begin(Lsn::NULL)).unwrap();
        log.insert(&LogRecord::chkpt_dev_tab(vec![])).unwrap();
        log.insert(&LogRecord::chkpt_buf_tab(vec![(
            PageId::new(1, 1, 55),
            begin2,
        )]))
        .unwrap();
        log.insert(&LogRecord::chkpt_xct_tab(
            9,
            vec![XctTabEntry {
                tid: 9,
                state: XctState::Active,
                last_lsn: begin2,
                first_lsn: begin2,
                undo_next: begin2,
            }],
        ))
        .unwrap();
        log.insert(&LogRecord::chkpt_end(begin2, begin2, begin2)).unwrap();
        log.flush_all().unwrap();
        // The master still points at the first checkpoint.
    }

    let engine = fx.restart(RestartOptions::serial());
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();

    assert_eq!(
        outcome.in_doubt_count, 1,
        "only page 42; the second checkpoint's buffer table was ignored"
    );
    assert!(outcome.commit_lsn.is_null());
    assert!(
        engine.txns.is_empty(),
        "transaction 9 from the ignored checkpoint was never created"
    );
}

#[test]
fn recovery_is_idempotent() {
    let fx = setup();
    let pid = PageId::new(1, 1, 42);

    {
        let log = fx.begin_history();
        log.insert(&LogRecord::btree_insert(1, Lsn::NULL, pid, 16, vec![9, 9]))
            .unwrap();
        log.flush_all().unwrap();
    }

    // First recovery rolls the loser back and checkpoints.
    {
        let engine = fx.restart(RestartOptions::serial());
        engine.manager.recover(engine.log.master_lsn()).unwrap();
    }
    let (lsn_after_first, buf_after_first) = read_disk_page(&fx.vol_path, 42);

    // Second recovery, no intervening writes.
    {
        let engine = fx.restart(RestartOptions::serial());
        let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();
        assert!(outcome.commit_lsn.is_null(), "no doomed transactions remain");
        assert_eq!(outcome.in_doubt_count, 0, "first recovery left nothing in doubt");
        assert!(engine.txns.is_empty());
    }
    let (lsn_after_second, buf_after_second) = read_disk_page(&fx.vol_path, 42);

    assert_eq!(lsn_after_first, lsn_after_second);
    assert_eq!(buf_after_first[..], buf_after_second[..]);
}

#[test]
fn two_losers_roll_back_in_reverse_chronological_order() {
    let fx = setup();
    let pid_a = PageId::new(1, 1, 10);
    let pid_b = PageId::new(1, 1, 11);

    let (a1, b1, a2);
    {
        let log = fx.begin_history();
        a1 = log
            .insert(&LogRecord::btree_update(1, Lsn::NULL, pid_a, 0, vec![0], vec![1]))
            .unwrap();
        b1 = log
            .insert(&LogRecord::btree_update(2, Lsn::NULL, pid_b, 0, vec![0], vec![2]))
            .unwrap();
        a2 = log
            .insert(&LogRecord::btree_update(1, a1, pid_a, 1, vec![0], vec![3]))
            .unwrap();
        log.flush_all().unwrap();
    }

    let engine = fx.restart(RestartOptions::serial());
    let outcome = engine.manager.recover(engine.log.master_lsn()).unwrap();

    assert_eq!(outcome.in_doubt_count, 2);
    assert_eq!(outcome.commit_lsn, a1, "earliest first LSN across the doomed");
    assert!(engine.txns.is_empty());

    // Both pages are back to their before-images.
    let (_, buf_a) = read_disk_page(&fx.vol_path, 10);
    assert_eq!(body_at(&buf_a, 0, 2), &[0, 0]);
    let (_, buf_b) = read_disk_page(&fx.vol_path, 11);
    assert_eq!(body_at(&buf_b, 0, 1), &[0]);

    // CLRs appear in reverse chronological order of the undone records:
    // a2 first, then b1, then a1.
    let mut cursor = engine.log.open_scan(a2, true);
    let mut clr_targets = Vec::new();
    while let Some((_, record)) = cursor.next().unwrap() {
        if record.kind == fenixdb::RecordKind::Compensate {
            if let fenixdb::wal::RecordPayload::Compensate { undo_next, .. } = record.payload {
                clr_targets.push(undo_next);
            }
        }
    }
    assert_eq!(clr_targets, vec![a1, Lsn::NULL, Lsn::NULL]);
}
