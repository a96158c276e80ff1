//! # Page Format
//!
//! Every page begins with a 32-byte header; the rest is the body that
//! update records splice bytes into. The header carries the page's
//! last-write LSN (the WAL coupling point: a page may reach disk only
//! after the log up to that LSN is durable) and a CRC-64 checksum that is
//! stamped when the page is written to its volume and verified when it is
//! read back.
//!
//! ```text
//! +---------------------------+
//! |    Header (32 bytes)      |   checksum | page_lsn | page_no | store | flags
//! +---------------------------+
//! |                           |
//! |    Body (16352 bytes)     |
//! |                           |
//! +---------------------------+
//! ```
//!
//! The checksum is computed with the checksum field itself zeroed, the same
//! discipline the recovery log applies to its records.

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{PAGE_BODY_SIZE, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::PageId;
use crate::wal::Lsn;

/// Shared CRC-64 instance for pages and log records.
pub(crate) const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// One in-memory page image.
pub type PageBuf = [u8; PAGE_SIZE];

#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    checksum: U64,
    page_lsn: U64,
    page_no: U32,
    store: U32,
    flags: U32,
    _reserved: [u8; 4],
}

impl PageHeader {
    zerocopy_accessors! {
        checksum: u64,
        page_lsn: u64,
        page_no: u32,
        store: u32,
        flags: u32,
    }
}

const _: () = assert!(std::mem::size_of::<PageHeader>() == PAGE_HEADER_SIZE);

/// Mutable view over one page frame.
pub struct PageMut<'a> {
    buf: &'a mut PageBuf,
}

impl<'a> PageMut<'a> {
    pub fn new(buf: &'a mut PageBuf) -> Self {
        Self { buf }
    }

    fn header(&self) -> &PageHeader {
        // The header prefix always has the right size, and the zerocopy LE
        // wrappers are alignment-free, so this conversion cannot fail.
        PageHeader::ref_from_bytes(&self.buf[..PAGE_HEADER_SIZE]).expect("page header layout")
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::mut_from_bytes(&mut self.buf[..PAGE_HEADER_SIZE]).expect("page header layout")
    }

    /// Last-write LSN recorded on the page.
    pub fn lsn(&self) -> Lsn {
        Lsn::from_raw(self.header().page_lsn())
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.header_mut().set_page_lsn(lsn.to_raw());
    }

    pub fn page_no(&self) -> u32 {
        self.header().page_no()
    }

    pub fn store(&self) -> u32 {
        self.header().store()
    }

    /// Reinitialize as an empty page belonging to `pid`. The caller sets the
    /// page LSN afterwards (the formatting record's LSN during redo).
    pub fn format(&mut self, pid: PageId) {
        self.buf.fill(0);
        let header = self.header_mut();
        header.set_page_no(pid.page_no);
        header.set_store(pid.store);
        header.set_page_lsn(Lsn::NULL.to_raw());
    }

    /// Splice `bytes` into the page body at `offset` (body-relative).
    pub fn write_body(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        ensure!(
            offset + bytes.len() <= PAGE_BODY_SIZE,
            "page body write of {} bytes at offset {} exceeds body size {}",
            bytes.len(),
            offset,
            PAGE_BODY_SIZE
        );
        let start = PAGE_HEADER_SIZE + offset;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn body(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }
}

/// Compute the page checksum (checksum field treated as zero).
pub fn compute_checksum(page: &[u8]) -> u64 {
    debug_assert_eq!(page.len(), PAGE_SIZE);
    let mut digest = CRC64.digest();
    digest.update(&[0u8; 8]);
    digest.update(&page[8..]);
    digest.finalize()
}

/// Stamp the checksum into the header. Done on the write path only; the
/// in-memory image keeps a zero checksum field.
pub fn stamp_checksum(page: &mut [u8]) {
    let checksum = compute_checksum(page);
    page[..8].copy_from_slice(&checksum.to_le_bytes());
}

/// Verify a page read back from disk.
pub fn verify_checksum(page: &[u8]) -> bool {
    let stored = u64::from_le_bytes([
        page[0], page[1], page[2], page[3], page[4], page[5], page[6], page[7],
    ]);
    stored == compute_checksum(page)
}
