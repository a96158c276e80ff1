//! Restart recovery benchmarks for FenixDB
//!
//! Measures full serial recovery (Analysis + Redo + Undo) over generated
//! crash histories of varying shape: all-committed workloads exercise the
//! Analysis and Redo scans, mixed workloads add rollback and CLR traffic
//! in the Undo pass.
//!
//! ## Running Benchmarks
//!
//! ```bash
//! cargo bench --bench recovery_bench
//! ```

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::{tempdir, TempDir};

use fenixdb::checkpoint;
use fenixdb::storage::Volume;
use fenixdb::{
    BufferPool, LogManager, LogRecord, Lsn, PageId, RestartManager, RestartOptions,
    TransactionTable, VolumeManager,
};

/// Write a crash history of `txn_count` transactions, each touching one
/// page with `updates_per_txn` updates; every `commit_every`-th commits.
fn build_history(txn_count: u64, updates_per_txn: u32, commit_every: u64) -> TempDir {
    let dir = tempdir().unwrap();
    let vol_path = dir.path().join("data.v1").to_string_lossy().into_owned();
    Volume::create(&vol_path, 1, 8).unwrap();

    let log = LogManager::create(dir.path().join("rlog")).unwrap();
    let volumes = VolumeManager::new();
    volumes.mount(&vol_path, 1).unwrap();
    let buffer = BufferPool::new(16);
    let txns = TransactionTable::new();
    checkpoint::synch_take(&log, &buffer, &txns, &volumes).unwrap();

    for tid in 1..=txn_count {
        let pid = PageId::new(1, 1, 100 + tid as u32);
        let mut prev = Lsn::NULL;
        prev = log
            .insert(&LogRecord::page_img_format(tid, prev, pid))
            .unwrap();
        for i in 0..updates_per_txn {
            let offset = (i * 8) as u16;
            prev = log
                .insert(&LogRecord::btree_update(
                    tid,
                    prev,
                    pid,
                    offset,
                    vec![0u8; 8],
                    vec![i as u8; 8],
                ))
                .unwrap();
        }
        if tid % commit_every == 0 {
            log.insert(&LogRecord::xct_end(tid, prev)).unwrap();
        }
    }
    log.flush_all().unwrap();
    dir
}

fn recover(dir: &TempDir) {
    let log = Arc::new(LogManager::open(dir.path().join("rlog")).unwrap());
    let buffer = Arc::new(BufferPool::new(4096));
    let txns = Arc::new(TransactionTable::new());
    let volumes = Arc::new(VolumeManager::new());
    let manager = RestartManager::new(
        Arc::clone(&log),
        buffer,
        txns,
        volumes,
        RestartOptions::serial(),
    )
    .unwrap();
    let master = log.master_lsn();
    manager.recover(master).unwrap();
}

fn bench_committed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_committed");
    group.sample_size(10);

    for txn_count in [50u64, 200].iter() {
        group.throughput(Throughput::Elements(*txn_count));
        group.bench_with_input(
            BenchmarkId::new("serial", txn_count),
            txn_count,
            |b, &txn_count| {
                b.iter_with_setup(|| build_history(txn_count, 4, 1), |dir| recover(&dir));
            },
        );
    }
    group.finish();
}

fn bench_mixed_workload(c: &mut Criterion) {
    let mut group = c.benchmark_group("recovery_mixed");
    group.sample_size(10);

    for txn_count in [50u64, 200].iter() {
        group.throughput(Throughput::Elements(*txn_count));
        group.bench_with_input(
            BenchmarkId::new("serial_half_doomed", txn_count),
            txn_count,
            |b, &txn_count| {
                b.iter_with_setup(|| build_history(txn_count, 4, 2), |dir| recover(&dir));
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_committed_workload, bench_mixed_workload);
criterion_main!(benches);
