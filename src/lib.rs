//! # FenixDB - Crash-Recovery Core
//!
//! FenixDB is the restart subsystem of a disk-based transactional storage
//! engine. After an unplanned shutdown it restores the on-disk database and
//! the in-memory buffer pool / transaction table to a transactionally
//! consistent state by replaying a partitioned, LSN-addressed recovery log.
//! The design follows the classical three-pass ARIES protocol with a
//! no-force, steal buffer policy:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                  RestartManager::recover                │
//! ├─────────────────────────────────────────────────────────┤
//! │                                                         │
//! │   Analysis ──> checkpoint ──> Redo ──> Undo ──> chkpt   │
//! │      │                         │        │               │
//! │      │ marks in-doubt pages,   │        │ rolls back    │
//! │      │ rebuilds txn table      │        │ doomed txns,  │
//! │      │                         │        │ emits CLRs    │
//! │      │                         │ loads pages, applies   │
//! │      │                         │ missing updates,       │
//! │      │                         │ in-doubt -> dirty      │
//! │      v                                                  │
//! │   concurrent mode: system opens here; Redo + Undo run   │
//! │   on a background worker, gated by commit_lsn           │
//! │                                                         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Layered architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Recovery (analysis/redo/undo)     │
//! ├──────────────────┬──────────────────┤
//! │ Transaction table│   Buffer pool    │
//! ├──────────────────┴──────────────────┤
//! │  Recovery log (partitioned, typed)  │
//! ├─────────────────────────────────────┤
//! │   Volumes (memory-mapped files)     │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File layout
//!
//! ```text
//! database_dir/
//! ├── data.v1              # Volume 1 (16KB pages, page 1 = store root)
//! ├── data.v2              # Volume 2
//! └── rlog/
//!     ├── log.master       # Master checkpoint record
//!     ├── log.00000001     # First log partition
//!     └── log.00000002     # Current partition (after rotation)
//! ```
//!
//! ## Module Overview
//!
//! - [`wal`]: partitioned recovery log, cursors, single-page repair
//! - [`storage`]: pages, checksums, volume mount table
//! - [`buffer`]: buffer pool with the in-doubt page protocol
//! - [`txn`]: transaction table, undo heap, rollback/abort
//! - [`recovery`]: the three passes and the restart coordinator
//! - [`checkpoint`]: synchronous checkpoint writer

#[macro_use]
mod macros;

pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod recovery;
pub mod storage;
pub mod txn;
pub mod wal;

pub use buffer::BufferPool;
pub use recovery::{
    OperatingMode, RecoveryState, RedoStrategy, RestartManager, RestartOptions, RestartOutcome,
    RestartPolicy, UndoStrategy,
};
pub use storage::{PageId, VolumeId, VolumeManager};
pub use txn::{Tid, TransactionTable, XctState};
pub use wal::{LogManager, LogRecord, Lsn, RecordKind};
