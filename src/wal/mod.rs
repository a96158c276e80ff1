//! # Partitioned Recovery Log
//!
//! The recovery log is an append-only sequence of typed records spread
//! over partition files. An LSN addresses a record as `(partition, byte
//! offset)`, so fetch-by-LSN is one bounded read with no index.
//!
//! ```text
//! rlog/
//! ├── log.master       # master checkpoint record (begin, min_rec, min_xct)
//! ├── log.00000001     # partition 1
//! ├── log.00000002     # partition 2 (ends with a skip record)
//! └── log.00000003     # current partition (append point)
//! ```
//!
//! ## Write Protocol
//!
//! 1. If the record would overflow the partition limit, append a `Skip`
//!    sentinel and open the next partition.
//! 2. Stamp the record's LSN into its header, checksum, append.
//! 3. `flush_all` syncs the active partition and advances `durable_lsn`.
//!
//! ## Read Protocol
//!
//! Closed partitions are read through a cached read-only mmap; the active
//! partition is read through the file directly (its mapping would go stale
//! on every append). Every fetched record is validated: checksum, length
//! bounds, recognized kind, and `lsn_ck == requested LSN`. Any mismatch is
//! log corruption and the caller treats it as fatal.
//!
//! ## Crash Tail
//!
//! On open, the newest partition is scanned record by record; the first
//! truncated or checksum-invalid record marks the logical end of the log
//! and the append point. A trailing `Skip` sentinel means the crash hit
//! between rotation steps, so the next partition is opened fresh.
//!
//! ## Logging Pause
//!
//! The Analysis pass must not generate log records. [`LogManager::pause_logging`]
//! returns an RAII guard; inserts while a guard is alive fail loudly
//! instead of corrupting the scan.

mod cursor;
mod lsn;
mod record;
mod spr;

pub use cursor::LogCursor;
pub use lsn::Lsn;
pub use record::{
    DevEntry, LogRecord, RecordHeader, RecordKind, RecordPayload, XctTabEntry, FLAG_ALLOC,
    FLAG_CPSN, FLAG_DEALLOC, FLAG_MULTI, FLAG_REDO, FLAG_SSX, FLAG_UNDO,
};
pub use spr::recover_single_page;

use std::fs::{create_dir_all, read_dir, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result, WrapErr};
use log::debug;
use memmap2::Mmap;
use parking_lot::{Mutex, RwLock};
use zerocopy::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{MASTER_FILE_NAME, MAX_LOG_PARTITION_SIZE, RECORD_HEADER_SIZE};
use crate::storage::page::CRC64;

fn partition_file_name(partition: u32) -> String {
    format!("log.{:08}", partition)
}

/// Persisted master checkpoint pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterInfo {
    pub master_lsn: Lsn,
    pub min_rec_lsn: Lsn,
    pub min_xct_lsn: Lsn,
}

impl MasterInfo {
    fn null() -> Self {
        Self {
            master_lsn: Lsn::NULL,
            min_rec_lsn: Lsn::NULL,
            min_xct_lsn: Lsn::NULL,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
struct MasterRecord {
    checksum: U64,
    master_lsn: U64,
    min_rec_lsn: U64,
    min_xct_lsn: U64,
}

impl MasterRecord {
    zerocopy_accessors! {
        checksum: u64,
        master_lsn: u64,
        min_rec_lsn: u64,
        min_xct_lsn: u64,
    }
}

struct LogInner {
    partition: File,
    partition_num: u32,
    offset: u64,
    durable_lsn: Lsn,
}

impl LogInner {
    fn curr_lsn(&self) -> Lsn {
        Lsn::new(self.partition_num, self.offset as u32)
    }
}

/// The partitioned, LSN-addressed recovery log.
pub struct LogManager {
    dir: PathBuf,
    inner: Mutex<LogInner>,
    /// Read-only mmap of one closed partition, keyed by partition number.
    read_cache: RwLock<Option<(u32, Mmap)>>,
    master: Mutex<MasterInfo>,
    logging_enabled: AtomicBool,
    partition_limit: u64,
}

impl LogManager {
    /// Create a fresh log directory with partition 1 and a null master.
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        create_dir_all(dir)
            .wrap_err_with(|| format!("failed to create log directory '{}'", dir.display()))?;

        let partition = open_partition(dir, 1, true)?;
        let manager = Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(LogInner {
                partition,
                partition_num: 1,
                offset: 0,
                durable_lsn: Lsn::new(1, 0),
            }),
            read_cache: RwLock::new(None),
            master: Mutex::new(MasterInfo::null()),
            logging_enabled: AtomicBool::new(true),
            partition_limit: MAX_LOG_PARTITION_SIZE,
        };
        manager.persist_master(MasterInfo::null())?;
        Ok(manager)
    }

    /// Open an existing log directory, locating the crash tail.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        ensure!(
            dir.is_dir(),
            "log directory '{}' does not exist",
            dir.display()
        );

        let mut partition_num = find_latest_partition(dir)?;
        let (mut end_offset, tail_is_skip) = scan_partition_end(dir, partition_num)?;
        if tail_is_skip {
            // Crash landed between writing the rotation sentinel and the
            // first insert into the next partition.
            partition_num += 1;
            end_offset = 0;
        }

        // Drop any torn tail so new inserts land at the logical end.
        let mut partition = open_partition(dir, partition_num, end_offset == 0)?;
        partition
            .set_len(end_offset)
            .wrap_err("failed to truncate torn log tail")?;
        partition
            .seek(SeekFrom::Start(end_offset))
            .wrap_err("failed to seek to the log append point")?;
        let master = read_master(dir)?;
        debug!(
            "opened recovery log at {} (master {})",
            Lsn::new(partition_num, end_offset as u32),
            master.master_lsn
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            inner: Mutex::new(LogInner {
                partition,
                partition_num,
                offset: end_offset,
                durable_lsn: Lsn::new(partition_num, end_offset as u32),
            }),
            read_cache: RwLock::new(None),
            master: Mutex::new(master),
            logging_enabled: AtomicBool::new(true),
            partition_limit: MAX_LOG_PARTITION_SIZE,
        })
    }

    /// Shrink the rotation threshold so tests can exercise partition
    /// crossings without writing megabytes of log.
    #[cfg(test)]
    pub(crate) fn set_partition_limit(&mut self, limit: u64) {
        self.partition_limit = limit;
    }

    /// Next LSN to be assigned.
    pub fn curr_lsn(&self) -> Lsn {
        self.inner.lock().curr_lsn()
    }

    pub fn durable_lsn(&self) -> Lsn {
        self.inner.lock().durable_lsn
    }

    /// Append one record; returns its LSN.
    pub fn insert(&self, record: &LogRecord) -> Result<Lsn> {
        ensure!(
            self.logging_enabled.load(Ordering::Acquire),
            "log insert while logging is paused (analysis must not log)"
        );
        let mut inner = self.inner.lock();

        let mut bytes = record.encode(inner.curr_lsn())?;
        if inner.offset + bytes.len() as u64 > self.partition_limit {
            self.rotate(&mut inner)?;
            bytes = record.encode(inner.curr_lsn())?;
        }

        let lsn = inner.curr_lsn();
        inner
            .partition
            .write_all(&bytes)
            .wrap_err_with(|| format!("failed to append log record at {}", lsn))?;
        inner.offset += bytes.len() as u64;
        Ok(lsn)
    }

    fn rotate(&self, inner: &mut LogInner) -> Result<()> {
        let skip = LogRecord::skip();
        let bytes = skip.encode(inner.curr_lsn())?;
        inner
            .partition
            .write_all(&bytes)
            .wrap_err("failed to append partition skip sentinel")?;
        inner
            .partition
            .sync_all()
            .wrap_err("failed to sync partition before rotation")?;

        let next = inner.partition_num + 1;
        debug!("rotating recovery log to partition {}", next);
        inner.partition = open_partition(&self.dir, next, true)?;
        inner.partition_num = next;
        inner.offset = 0;
        Ok(())
    }

    /// Sync the active partition; everything inserted so far becomes durable.
    pub fn flush_all(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .partition
            .sync_all()
            .wrap_err("failed to sync recovery log")?;
        inner.durable_lsn = inner.curr_lsn();
        Ok(())
    }

    /// Fetch and validate the record at `lsn`.
    pub fn fetch(&self, lsn: Lsn) -> Result<LogRecord> {
        let (partition_num, curr) = {
            let inner = self.inner.lock();
            (inner.partition_num, inner.curr_lsn())
        };
        ensure!(!lsn.is_null(), "cannot fetch the null LSN");
        ensure!(lsn < curr, "fetch at {} is past the end of the log ({})", lsn, curr);

        let bytes = if lsn.partition() == partition_num {
            self.read_active(lsn)?
        } else {
            self.read_closed(lsn)?
        };

        let record = LogRecord::decode(&bytes)?;
        ensure!(
            record.lsn == lsn,
            "log corruption: record at {} self-describes as {}",
            lsn,
            record.lsn
        );
        Ok(record)
    }

    fn read_active(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let path = self.dir.join(partition_file_name(lsn.partition()));
        let mut file = File::open(&path)
            .wrap_err_with(|| format!("failed to open active partition '{}'", path.display()))?;
        read_record_at(&mut file, lsn)
    }

    fn read_closed(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let partition = lsn.partition();
        let mut cache = self.read_cache.write();
        let needs_reload = match cache.as_ref() {
            Some((cached, _)) => *cached != partition,
            None => true,
        };
        if needs_reload {
            let path = self.dir.join(partition_file_name(partition));
            let file = File::open(&path)
                .wrap_err_with(|| format!("failed to open log partition '{}'", path.display()))?;
            // SAFETY: closed partitions are never written again; the mapping
            // lives inside the cache and is replaced wholesale.
            let mmap = unsafe {
                Mmap::map(&file)
                    .wrap_err_with(|| format!("failed to mmap log partition '{}'", path.display()))?
            };
            *cache = Some((partition, mmap));
        }
        let (_, mmap) = cache.as_ref().expect("partition cache populated above");
        slice_record(&mmap[..], lsn)
    }

    /// Byte length of useful data in `partition`, or `None` if the
    /// partition does not exist. For the active partition this is the
    /// append offset.
    pub(crate) fn partition_end(&self, partition: u32) -> Result<Option<u64>> {
        let inner = self.inner.lock();
        if partition == inner.partition_num {
            return Ok(Some(inner.offset));
        }
        if partition > inner.partition_num {
            return Ok(None);
        }
        drop(inner);
        let path = self.dir.join(partition_file_name(partition));
        if !path.exists() {
            return Ok(None);
        }
        let len = path
            .metadata()
            .wrap_err_with(|| format!("failed to stat partition '{}'", path.display()))?
            .len();
        Ok(Some(len))
    }

    /// Open a scan; see [`LogCursor`].
    pub fn open_scan(&self, start: Lsn, forward: bool) -> LogCursor<'_> {
        LogCursor::new(self, start, forward)
    }

    // ------------------------------------------------------------------
    // Master checkpoint record
    // ------------------------------------------------------------------

    pub fn master(&self) -> MasterInfo {
        *self.master.lock()
    }

    pub fn master_lsn(&self) -> Lsn {
        self.master.lock().master_lsn
    }

    pub fn set_master(&self, info: MasterInfo) -> Result<()> {
        self.persist_master(info)?;
        *self.master.lock() = info;
        Ok(())
    }

    fn persist_master(&self, info: MasterInfo) -> Result<()> {
        let mut record = MasterRecord {
            checksum: U64::new(0),
            master_lsn: U64::new(info.master_lsn.to_raw()),
            min_rec_lsn: U64::new(info.min_rec_lsn.to_raw()),
            min_xct_lsn: U64::new(info.min_xct_lsn.to_raw()),
        };
        let mut digest = CRC64.digest();
        digest.update(record.as_bytes());
        record.set_checksum(digest.finalize());

        let path = self.dir.join(MASTER_FILE_NAME);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open master file '{}'", path.display()))?;
        file.write_all(record.as_bytes())
            .wrap_err("failed to write master record")?;
        file.sync_all().wrap_err("failed to sync master record")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Logging pause
    // ------------------------------------------------------------------

    /// Reject inserts until the returned guard drops.
    pub fn pause_logging(&self) -> LoggingPause<'_> {
        self.logging_enabled.store(false, Ordering::Release);
        LoggingPause { log: self }
    }
}

/// RAII guard: log inserts fail while this is alive.
pub struct LoggingPause<'a> {
    log: &'a LogManager,
}

impl Drop for LoggingPause<'_> {
    fn drop(&mut self) {
        self.log.logging_enabled.store(true, Ordering::Release);
    }
}

fn open_partition(dir: &Path, partition: u32, truncate: bool) -> Result<File> {
    let path = dir.join(partition_file_name(partition));
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if truncate {
        options.truncate(true);
    }
    let mut file = options
        .open(&path)
        .wrap_err_with(|| format!("failed to open log partition '{}'", path.display()))?;
    file.seek(SeekFrom::End(0))
        .wrap_err("failed to seek to partition end")?;
    Ok(file)
}

fn find_latest_partition(dir: &Path) -> Result<u32> {
    let entries = read_dir(dir)
        .wrap_err_with(|| format!("failed to read log directory '{}'", dir.display()))?;

    let mut max_partition = 0u32;
    for entry in entries {
        let entry = entry.wrap_err("failed to read log directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(num_part) = name.strip_prefix("log.") {
            if let Ok(partition) = num_part.parse::<u32>() {
                max_partition = max_partition.max(partition);
            }
        }
    }
    Ok(if max_partition == 0 { 1 } else { max_partition })
}

/// Scan one partition from the front and return `(logical end offset,
/// whether the last valid record is a skip sentinel)`.
fn scan_partition_end(dir: &Path, partition: u32) -> Result<(u64, bool)> {
    let path = dir.join(partition_file_name(partition));
    if !path.exists() {
        return Ok((0, false));
    }
    let mut file = File::open(&path)
        .wrap_err_with(|| format!("failed to open log partition '{}'", path.display()))?;
    let file_len = file
        .metadata()
        .wrap_err("failed to stat log partition")?
        .len();

    let mut offset = 0u64;
    let mut tail_is_skip = false;
    loop {
        if offset + RECORD_HEADER_SIZE as u64 > file_len {
            break;
        }
        let lsn = Lsn::new(partition, offset as u32);
        let bytes = match read_record_at(&mut file, lsn) {
            Ok(bytes) => bytes,
            // A torn tail write reads as truncation or checksum failure.
            Err(_) => break,
        };
        let record = match LogRecord::decode(&bytes) {
            Ok(record) if record.lsn == lsn => record,
            _ => break,
        };
        tail_is_skip = record.is_skip();
        offset += bytes.len() as u64;
    }
    Ok((offset, tail_is_skip))
}

fn read_record_at(file: &mut File, lsn: Lsn) -> Result<Vec<u8>> {
    let file_len = file
        .metadata()
        .wrap_err("failed to stat log partition")?
        .len();
    let offset = lsn.offset() as u64;
    ensure!(
        offset + RECORD_HEADER_SIZE as u64 <= file_len,
        "log record at {} lies beyond the partition ({} bytes)",
        lsn,
        file_len
    );

    file.seek(SeekFrom::Start(offset))
        .wrap_err("failed to seek in log partition")?;
    let mut header = vec![0u8; RECORD_HEADER_SIZE];
    file.read_exact(&mut header)
        .wrap_err_with(|| format!("failed to read log record header at {}", lsn))?;

    let length = record_length(&header, lsn, file_len - offset)?;
    let mut bytes = header;
    bytes.resize(length, 0);
    file.read_exact(&mut bytes[RECORD_HEADER_SIZE..])
        .wrap_err_with(|| format!("failed to read log record body at {}", lsn))?;
    Ok(bytes)
}

fn slice_record(data: &[u8], lsn: Lsn) -> Result<Vec<u8>> {
    let offset = lsn.offset() as usize;
    ensure!(
        offset + RECORD_HEADER_SIZE <= data.len(),
        "log record at {} lies beyond the partition ({} bytes)",
        lsn,
        data.len()
    );
    let header = &data[offset..offset + RECORD_HEADER_SIZE];
    let length = record_length(header, lsn, (data.len() - offset) as u64)?;
    Ok(data[offset..offset + length].to_vec())
}

fn record_length(header: &[u8], lsn: Lsn, remaining: u64) -> Result<usize> {
    let raw = RecordHeader::read_from_bytes(header)
        .map_err(|e| eyre::eyre!("malformed log record header at {}: {:?}", lsn, e))?;
    let length = raw.length() as usize;
    ensure!(
        length >= RECORD_HEADER_SIZE && length as u64 <= remaining,
        "log record at {} has invalid length {}",
        lsn,
        length
    );
    Ok(length)
}

fn read_master(dir: &Path) -> Result<MasterInfo> {
    let path = dir.join(MASTER_FILE_NAME);
    if !path.exists() {
        return Ok(MasterInfo::null());
    }
    let mut bytes = Vec::new();
    File::open(&path)
        .wrap_err_with(|| format!("failed to open master file '{}'", path.display()))?
        .read_to_end(&mut bytes)
        .wrap_err("failed to read master record")?;

    let record = MasterRecord::read_from_bytes(&bytes)
        .map_err(|e| eyre::eyre!("malformed master record: {:?}", e))?;

    let mut check = record;
    check.set_checksum(0);
    let mut digest = CRC64.digest();
    digest.update(check.as_bytes());
    ensure!(
        digest.finalize() == record.checksum(),
        "master record checksum mismatch"
    );

    Ok(MasterInfo {
        master_lsn: Lsn::from_raw(record.master_lsn()),
        min_rec_lsn: Lsn::from_raw(record.min_rec_lsn()),
        min_xct_lsn: Lsn::from_raw(record.min_xct_lsn()),
    })
}
