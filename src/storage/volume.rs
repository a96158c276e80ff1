//! # Volumes and the Mount Table
//!
//! A volume is one memory-mapped file of pages. The `VolumeManager` is the
//! mount table: recovery drives it from the checkpoint device table and
//! from mount/dismount log records so that the volumes mounted at the redo
//! start LSN match what forward processing had mounted before the crash.
//!
//! ## Page addressing
//!
//! Page numbers are 1-based; page `n` lives at file offset
//! `(n - 1) * PAGE_SIZE`. A read past the end of the file is not an error:
//! it means the page was never flushed before the crash (a *virgin* page
//! whose image exists only in the log), and the caller receives a zeroed
//! buffer with the `PastEnd` outcome. A read whose checksum does not verify
//! returns `BadChecksum`; the caller repairs the page from the log.
//!
//! ## Durability
//!
//! `write_page` stamps the page checksum into the on-disk image; the
//! in-memory frames keep a zero checksum field. `sync_all` flushes every
//! mapped volume, which the buffer pool's `force_all` relies on.

use std::fs::OpenOptions;
use std::path::Path;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use log::{debug, warn};
use memmap2::MmapMut;
use parking_lot::{Mutex, RwLock};

use crate::config::{PAGE_SIZE, ROOT_PAGE_NO, VOLUME_INITIAL_PAGES};
use crate::storage::page::{self, PageBuf, PageMut};
use crate::storage::{PageId, VolumeId};
use crate::wal::Lsn;

/// Result of reading one page image from a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageReadOutcome {
    /// Page read and checksum verified.
    Loaded,
    /// Page lies beyond the end of the file: never flushed, virgin.
    PastEnd,
    /// Page read but the checksum does not verify.
    BadChecksum,
}

pub struct Volume {
    dev_name: String,
    file: std::fs::File,
    mmap: MmapMut,
    page_count: u32,
}

impl Volume {
    /// Create a volume file formatted with `initial_pages` empty pages
    /// (checksummed, null page LSN) so fresh volumes read back cleanly.
    pub fn create<P: AsRef<Path>>(path: P, vol: VolumeId, initial_pages: u32) -> Result<Self> {
        let path = path.as_ref();
        ensure!(initial_pages >= 1, "a volume needs at least its root page");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create volume file '{}'", path.display()))?;

        let file_size = initial_pages as u64 * PAGE_SIZE as u64;
        file.set_len(file_size)
            .wrap_err_with(|| format!("failed to size volume file to {} bytes", file_size))?;

        // SAFETY: the file was just created with exclusive access, its size
        // is a multiple of PAGE_SIZE, and the mapping's lifetime is tied to
        // this Volume. All access is bounds-checked through page offsets.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        let mut volume = Self {
            dev_name: path.to_string_lossy().into_owned(),
            file,
            mmap,
            page_count: initial_pages,
        };

        let mut buf: PageBuf = [0u8; PAGE_SIZE];
        for page_no in 1..=initial_pages {
            let mut page = PageMut::new(&mut buf);
            page.format(PageId::new(vol, 0, page_no));
            volume.write_page(page_no, &buf)?;
        }
        Ok(volume)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open volume file '{}'", path.display()))?;

        let file_size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat volume file '{}'", path.display()))?
            .len();
        ensure!(
            file_size > 0 && file_size % PAGE_SIZE as u64 == 0,
            "volume file '{}' size {} is not a positive multiple of the page size",
            path.display(),
            file_size
        );

        // SAFETY: volume files are owned exclusively by this process; the
        // mapping's lifetime is tied to this Volume and all access is
        // bounds-checked through page offsets.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            dev_name: path.to_string_lossy().into_owned(),
            file,
            mmap,
            page_count: (file_size / PAGE_SIZE as u64) as u32,
        })
    }

    pub fn dev_name(&self) -> &str {
        &self.dev_name
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    fn page_offset(page_no: u32) -> usize {
        (page_no as usize - 1) * PAGE_SIZE
    }

    /// Read one page into `out`. See [`PageReadOutcome`] for the virgin and
    /// corruption cases; for both, `out` holds a zeroed (`PastEnd`) or
    /// as-read (`BadChecksum`) image and the caller decides how to proceed.
    pub fn read_page(&self, page_no: u32, out: &mut PageBuf) -> Result<PageReadOutcome> {
        ensure!(page_no != 0, "page number 0 is the null page id");
        if page_no > self.page_count {
            out.fill(0);
            return Ok(PageReadOutcome::PastEnd);
        }
        let offset = Self::page_offset(page_no);
        out.copy_from_slice(&self.mmap[offset..offset + PAGE_SIZE]);
        if !page::verify_checksum(out) {
            return Ok(PageReadOutcome::BadChecksum);
        }
        // In-memory images keep a zero checksum field.
        out[..8].fill(0);
        Ok(PageReadOutcome::Loaded)
    }

    /// Write one page image, growing the file if the page is new. The
    /// checksum is stamped into the on-disk copy.
    pub fn write_page(&mut self, page_no: u32, data: &PageBuf) -> Result<()> {
        ensure!(page_no != 0, "page number 0 is the null page id");
        if page_no > self.page_count {
            self.grow(page_no)?;
        }
        let offset = Self::page_offset(page_no);
        self.mmap[offset..offset + PAGE_SIZE].copy_from_slice(data);
        page::stamp_checksum(&mut self.mmap[offset..offset + PAGE_SIZE]);
        Ok(())
    }

    fn grow(&mut self, page_count: u32) -> Result<()> {
        let new_size = page_count as u64 * PAGE_SIZE as u64;
        self.file
            .set_len(new_size)
            .wrap_err_with(|| format!("failed to grow volume '{}'", self.dev_name))?;
        // SAFETY: same invariants as at open; the old mapping is dropped
        // before the new one is installed and no page references escape
        // this struct.
        self.mmap = unsafe {
            MmapMut::map_mut(&self.file)
                .wrap_err_with(|| format!("failed to re-map volume '{}'", self.dev_name))?
        };
        self.page_count = page_count;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.mmap
            .flush()
            .wrap_err_with(|| format!("failed to sync volume '{}'", self.dev_name))
    }
}

/// The mount table: volume id to mapped volume file.
pub struct VolumeManager {
    vols: RwLock<HashMap<VolumeId, Volume>>,
    last_mount_lsn: Mutex<Lsn>,
}

impl VolumeManager {
    pub fn new() -> Self {
        Self {
            vols: RwLock::new(HashMap::new()),
            last_mount_lsn: Mutex::new(Lsn::NULL),
        }
    }

    /// Mount `dev_name` as `vol`, creating the volume file if it does not
    /// exist yet. Mounting an already-mounted volume is a no-op.
    pub fn mount(&self, dev_name: &str, vol: VolumeId) -> Result<()> {
        let mut vols = self.vols.write();
        if vols.contains_key(&vol) {
            debug!("volume {} already mounted", vol);
            return Ok(());
        }
        let volume = if Path::new(dev_name).exists() {
            Volume::open(dev_name)?
        } else {
            Volume::create(dev_name, vol, VOLUME_INITIAL_PAGES)?
        };
        debug!("mounted '{}' as volume {}", dev_name, vol);
        vols.insert(vol, volume);
        Ok(())
    }

    /// Mount, downgrading failure to a warning. Recovery replays mount
    /// events whose volume may have been legitimately destroyed since.
    pub fn mount_lenient(&self, dev_name: &str, vol: VolumeId) {
        if let Err(err) = self.mount(dev_name, vol) {
            warn!("ignoring mount failure for '{}': {:#}", dev_name, err);
        }
    }

    pub fn dismount(&self, vol: VolumeId) -> Result<()> {
        match self.vols.write().remove(&vol) {
            Some(volume) => {
                volume.sync()?;
                debug!("dismounted volume {}", vol);
                Ok(())
            }
            None => bail!("volume {} is not mounted", vol),
        }
    }

    pub fn dismount_lenient(&self, vol: VolumeId) {
        if let Err(err) = self.dismount(vol) {
            warn!("ignoring dismount failure for volume {}: {:#}", vol, err);
        }
    }

    pub fn is_mounted(&self, vol: VolumeId) -> bool {
        self.vols.read().contains_key(&vol)
    }

    pub fn mounted_count(&self) -> usize {
        self.vols.read().len()
    }

    /// Snapshot of `(vol, dev_name)` pairs for the checkpoint device table.
    pub fn mounted_devices(&self) -> Vec<(VolumeId, String)> {
        let mut devices: Vec<_> = self
            .vols
            .read()
            .iter()
            .map(|(vol, v)| (*vol, v.dev_name().to_owned()))
            .collect();
        devices.sort_by_key(|(vol, _)| *vol);
        devices
    }

    pub fn read_page(&self, pid: PageId, out: &mut PageBuf) -> Result<PageReadOutcome> {
        let vols = self.vols.read();
        match vols.get(&pid.vol) {
            Some(volume) => volume.read_page(pid.page_no, out),
            None => bail!("volume {} is not mounted (reading page {})", pid.vol, pid),
        }
    }

    pub fn write_page(&self, pid: PageId, data: &PageBuf) -> Result<()> {
        let mut vols = self.vols.write();
        match vols.get_mut(&pid.vol) {
            Some(volume) => volume.write_page(pid.page_no, data),
            None => bail!("volume {} is not mounted (writing page {})", pid.vol, pid),
        }
    }

    /// Whether the volume's root page exists on disk (it would have been
    /// preloaded at mount time during forward processing).
    pub fn root_page_exists(&self, vol: VolumeId) -> bool {
        self.vols
            .read()
            .get(&vol)
            .map(|v| v.page_count() >= ROOT_PAGE_NO)
            .unwrap_or(false)
    }

    pub fn sync_all(&self) -> Result<()> {
        for volume in self.vols.read().values() {
            volume.sync()?;
        }
        Ok(())
    }

    /// LSN of the most recent mount/dismount log record.
    pub fn last_mount_lsn(&self) -> Lsn {
        *self.last_mount_lsn.lock()
    }

    pub fn set_last_mount_lsn(&self, lsn: Lsn) {
        *self.last_mount_lsn.lock() = lsn;
    }
}

impl Default for VolumeManager {
    fn default() -> Self {
        Self::new()
    }
}
