//! # Recovery Log Records
//!
//! Every entry in the recovery log is a typed record: a fixed 64-byte header
//! followed by a kind-specific payload, checksummed as a unit with
//! CRC-64/ECMA-182 (the same algorithm the volume pages use).
//!
//! ## Record Format
//!
//! ```text
//! +---------------------+----------------------+
//! | RecordHeader        | Payload              |
//! | (64 bytes)          | (variable, may be 0) |
//! +---------------------+----------------------+
//! ```
//!
//! The header carries:
//! - `checksum`: CRC-64 over the whole record with this field zeroed
//! - `lsn`: the record's own LSN, stamped at insert time. Readers compare
//!   it against the LSN they fetched from (the `lsn_ck` integrity check);
//!   a mismatch means log corruption and is fatal.
//! - `length`: total record length including the header
//! - `kind` + `flags`: the record kind and its redo/undo/system bits
//! - `tid`: owning transaction, 0 for records without one
//! - `prev_lsn`: previous record of the same transaction (for mount and
//!   dismount records, the previous mount/dismount record instead)
//! - up to two page ids (`page2` is used only by multi-page records)
//!
//! ## Flags
//!
//! Flags are stored rather than derived so a record is self-describing on
//! disk; the constructors set them canonically per kind. `REDO`/`UNDO`
//! drive the recovery passes; `CPSN` marks compensation records (redo-only
//! by construction — an undoable compensation record is fatal wherever it
//! is observed); `SSX` marks single-log system transactions, which have no
//! transaction id and complete atomically with their single record.

use eyre::{bail, ensure, Result};
use smallvec::SmallVec;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::config::{MAX_RECORD_SIZE, RECORD_HEADER_SIZE};
use crate::storage::page::{PageMut, CRC64};
use crate::storage::PageId;
use crate::txn::{Tid, XctState};
use crate::wal::Lsn;

pub const FLAG_REDO: u8 = 0x01;
pub const FLAG_UNDO: u8 = 0x02;
pub const FLAG_CPSN: u8 = 0x04;
pub const FLAG_SSX: u8 = 0x08;
pub const FLAG_MULTI: u8 = 0x10;
pub const FLAG_ALLOC: u8 = 0x20;
pub const FLAG_DEALLOC: u8 = 0x40;

/// Kinds of records in the recovery log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Free-form annotation, ignored by recovery.
    Comment = 1,
    /// Partition sentinel: marks the end of useful data in a partition.
    Skip = 2,
    /// Start of a checkpoint; payload carries the last mount/dismount LSN.
    ChkptBegin = 3,
    /// Checkpoint snapshot of in-doubt/dirty pages with their rec LSNs.
    ChkptBufTab = 4,
    /// Checkpoint snapshot of the transaction table.
    ChkptXctTab = 5,
    /// Checkpoint snapshot of the mounted device table.
    ChkptDevTab = 6,
    /// End of a checkpoint; carries (begin, min_rec_lsn, min_xct_lsn).
    ChkptEnd = 7,
    /// Volume mount event.
    Mount = 8,
    /// Volume dismount event.
    Dismount = 9,
    /// Transaction committed.
    XctEnd = 10,
    /// Transaction aborted (rollback completed).
    XctAbort = 11,
    /// Group commit: payload lists the finished transaction ids.
    XctEndGroup = 12,
    /// Transaction entered its space-freeing commit phase.
    XctFreeingSpace = 13,
    /// Compensation record written by undo; redo-only.
    Compensate = 14,
    /// Store-level metadata operation; no transaction, no buffered page.
    StoreOperation = 15,
    /// Page allocation (single-log system transaction).
    AllocPage = 16,
    /// Page deallocation (single-log system transaction).
    DeallocPage = 17,
    /// Full page format; the target page needs no prior on-disk image.
    PageImgFormat = 18,
    /// B-tree page split without record movement; multi-page system
    /// transaction whose second page is the freshly allocated child.
    BtreeNorecAlloc = 19,
    /// B-tree insert.
    BtreeInsert = 20,
    /// B-tree in-place update.
    BtreeUpdate = 21,
    /// B-tree ghost (logical delete) mark.
    BtreeGhostMark = 22,
}

impl RecordKind {
    pub fn from_u8(raw: u8) -> Result<Self> {
        Ok(match raw {
            1 => Self::Comment,
            2 => Self::Skip,
            3 => Self::ChkptBegin,
            4 => Self::ChkptBufTab,
            5 => Self::ChkptXctTab,
            6 => Self::ChkptDevTab,
            7 => Self::ChkptEnd,
            8 => Self::Mount,
            9 => Self::Dismount,
            10 => Self::XctEnd,
            11 => Self::XctAbort,
            12 => Self::XctEndGroup,
            13 => Self::XctFreeingSpace,
            14 => Self::Compensate,
            15 => Self::StoreOperation,
            16 => Self::AllocPage,
            17 => Self::DeallocPage,
            18 => Self::PageImgFormat,
            19 => Self::BtreeNorecAlloc,
            20 => Self::BtreeInsert,
            21 => Self::BtreeUpdate,
            22 => Self::BtreeGhostMark,
            other => bail!("unknown log record kind {}", other),
        })
    }

    /// Update-style records: redoable page updates owned by a transaction.
    pub fn is_page_update(self) -> bool {
        matches!(
            self,
            Self::AllocPage
                | Self::DeallocPage
                | Self::PageImgFormat
                | Self::BtreeInsert
                | Self::BtreeUpdate
                | Self::BtreeGhostMark
        )
    }
}

/// Fixed on-disk header of every log record.
#[repr(C)]
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct RecordHeader {
    checksum: U64,
    lsn: U64,
    length: U32,
    pub kind: u8,
    pub flags: u8,
    _pad: [u8; 2],
    tid: U64,
    prev_lsn: U64,
    page_vol: U32,
    page_store: U32,
    page_no: U32,
    page2_vol: U32,
    page2_store: U32,
    page2_no: U32,
}

impl RecordHeader {
    zerocopy_accessors! {
        checksum: u64,
        lsn: u64,
        length: u32,
        tid: u64,
        prev_lsn: u64,
        page_vol: u32,
        page_store: u32,
        page_no: u32,
        page2_vol: u32,
        page2_store: u32,
        page2_no: u32,
    }
}

const _: () = assert!(std::mem::size_of::<RecordHeader>() == RECORD_HEADER_SIZE);

/// Transaction table entry as persisted in a `ChkptXctTab` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XctTabEntry {
    pub tid: Tid,
    pub state: XctState,
    pub last_lsn: Lsn,
    pub first_lsn: Lsn,
    pub undo_next: Lsn,
}

/// Device table entry as persisted in `ChkptDevTab` and mount records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevEntry {
    pub vol: u32,
    pub dev_name: String,
}

/// Kind-specific record payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    None,
    Comment(String),
    ChkptBegin {
        last_mount_lsn: Lsn,
    },
    ChkptBufTab {
        pages: Vec<(PageId, Lsn)>,
    },
    ChkptXctTab {
        youngest: Tid,
        entries: Vec<XctTabEntry>,
    },
    ChkptDevTab {
        devices: Vec<DevEntry>,
    },
    ChkptEnd {
        begin_chkpt: Lsn,
        min_rec_lsn: Lsn,
        min_xct_lsn: Lsn,
    },
    Device(DevEntry),
    XctList(SmallVec<[Tid; 8]>),
    Compensate {
        undo_next: Lsn,
        offset: u16,
        data: Vec<u8>,
    },
    StoreOperation {
        vol: u32,
        store: u32,
        op: u8,
    },
    Update {
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    },
    NorecAlloc {
        dest_offset: u16,
        dest_bytes: Vec<u8>,
    },
}

/// One decoded recovery log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub kind: RecordKind,
    pub flags: u8,
    /// Self-described LSN (`lsn_ck`); stamped at insert time.
    pub lsn: Lsn,
    /// Owning transaction id; 0 for records without one.
    pub tid: Tid,
    /// Previous record of the same transaction (mount chain for
    /// mount/dismount records).
    pub prev_lsn: Lsn,
    pub page_id: Option<PageId>,
    pub page_id2: Option<PageId>,
    pub payload: RecordPayload,
    /// On-disk length in bytes; 0 until the record has been encoded or
    /// decoded.
    pub(crate) len: u32,
}

impl LogRecord {
    fn new(kind: RecordKind, flags: u8) -> Self {
        Self {
            kind,
            flags,
            lsn: Lsn::NULL,
            tid: 0,
            prev_lsn: Lsn::NULL,
            page_id: None,
            page_id2: None,
            payload: RecordPayload::None,
            len: 0,
        }
    }

    pub fn comment(text: &str) -> Self {
        let mut r = Self::new(RecordKind::Comment, 0);
        r.payload = RecordPayload::Comment(text.to_owned());
        r
    }

    pub fn skip() -> Self {
        Self::new(RecordKind::Skip, 0)
    }

    pub fn chkpt_begin(last_mount_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::ChkptBegin, 0);
        r.payload = RecordPayload::ChkptBegin { last_mount_lsn };
        r
    }

    pub fn chkpt_buf_tab(pages: Vec<(PageId, Lsn)>) -> Self {
        let mut r = Self::new(RecordKind::ChkptBufTab, 0);
        r.payload = RecordPayload::ChkptBufTab { pages };
        r
    }

    pub fn chkpt_xct_tab(youngest: Tid, entries: Vec<XctTabEntry>) -> Self {
        let mut r = Self::new(RecordKind::ChkptXctTab, 0);
        r.payload = RecordPayload::ChkptXctTab { youngest, entries };
        r
    }

    pub fn chkpt_dev_tab(devices: Vec<DevEntry>) -> Self {
        let mut r = Self::new(RecordKind::ChkptDevTab, 0);
        r.payload = RecordPayload::ChkptDevTab { devices };
        r
    }

    pub fn chkpt_end(begin_chkpt: Lsn, min_rec_lsn: Lsn, min_xct_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::ChkptEnd, 0);
        r.payload = RecordPayload::ChkptEnd {
            begin_chkpt,
            min_rec_lsn,
            min_xct_lsn,
        };
        r
    }

    /// `prev_mount_lsn` chains to the previous mount/dismount record.
    pub fn mount(dev_name: &str, vol: u32, prev_mount_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::Mount, FLAG_REDO);
        r.prev_lsn = prev_mount_lsn;
        r.payload = RecordPayload::Device(DevEntry {
            vol,
            dev_name: dev_name.to_owned(),
        });
        r
    }

    pub fn dismount(dev_name: &str, vol: u32, prev_mount_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::Dismount, FLAG_REDO);
        r.prev_lsn = prev_mount_lsn;
        r.payload = RecordPayload::Device(DevEntry {
            vol,
            dev_name: dev_name.to_owned(),
        });
        r
    }

    pub fn xct_end(tid: Tid, prev_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::XctEnd, 0);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r
    }

    pub fn xct_abort(tid: Tid, prev_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::XctAbort, 0);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r
    }

    pub fn xct_freeing_space(tid: Tid, prev_lsn: Lsn) -> Self {
        let mut r = Self::new(RecordKind::XctFreeingSpace, 0);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r
    }

    pub fn xct_end_group(tids: &[Tid]) -> Self {
        let mut r = Self::new(RecordKind::XctEndGroup, 0);
        r.payload = RecordPayload::XctList(SmallVec::from_slice(tids));
        r
    }

    /// Compensation record: redo-only image restore written during undo.
    /// `undo_next` is the compensated-to LSN (the `prev_lsn` of the record
    /// that was just undone).
    pub fn compensate(
        tid: Tid,
        prev_lsn: Lsn,
        page: PageId,
        undo_next: Lsn,
        offset: u16,
        data: Vec<u8>,
    ) -> Self {
        let mut r = Self::new(RecordKind::Compensate, FLAG_REDO | FLAG_CPSN);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r.page_id = Some(page);
        r.payload = RecordPayload::Compensate {
            undo_next,
            offset,
            data,
        };
        r
    }

    pub fn store_operation(vol: u32, store: u32, op: u8) -> Self {
        let mut r = Self::new(RecordKind::StoreOperation, FLAG_REDO);
        r.payload = RecordPayload::StoreOperation { vol, store, op };
        r
    }

    pub fn alloc_page(page: PageId) -> Self {
        let mut r = Self::new(RecordKind::AllocPage, FLAG_REDO | FLAG_SSX | FLAG_ALLOC);
        r.page_id = Some(page);
        r
    }

    pub fn dealloc_page(page: PageId) -> Self {
        let mut r = Self::new(RecordKind::DeallocPage, FLAG_REDO | FLAG_SSX | FLAG_DEALLOC);
        r.page_id = Some(page);
        r
    }

    /// Full page format inside a transaction. Redo-only: undoing a loser's
    /// format is the deallocation system transaction's job.
    pub fn page_img_format(tid: Tid, prev_lsn: Lsn, page: PageId) -> Self {
        let mut r = Self::new(RecordKind::PageImgFormat, FLAG_REDO);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r.page_id = Some(page);
        r
    }

    /// Multi-page system transaction: `dest` gets `dest_bytes` spliced in,
    /// `new_child` (the second page) is formatted from nothing.
    pub fn btree_norec_alloc(
        dest: PageId,
        new_child: PageId,
        dest_offset: u16,
        dest_bytes: Vec<u8>,
    ) -> Self {
        let mut r = Self::new(
            RecordKind::BtreeNorecAlloc,
            FLAG_REDO | FLAG_SSX | FLAG_MULTI,
        );
        r.page_id = Some(dest);
        r.page_id2 = Some(new_child);
        r.payload = RecordPayload::NorecAlloc {
            dest_offset,
            dest_bytes,
        };
        r
    }

    pub fn btree_insert(tid: Tid, prev_lsn: Lsn, page: PageId, offset: u16, after: Vec<u8>) -> Self {
        let mut r = Self::new(RecordKind::BtreeInsert, FLAG_REDO | FLAG_UNDO);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r.page_id = Some(page);
        r.payload = RecordPayload::Update {
            offset,
            before: vec![0u8; after.len()],
            after,
        };
        r
    }

    pub fn btree_update(
        tid: Tid,
        prev_lsn: Lsn,
        page: PageId,
        offset: u16,
        before: Vec<u8>,
        after: Vec<u8>,
    ) -> Self {
        let mut r = Self::new(RecordKind::BtreeUpdate, FLAG_REDO | FLAG_UNDO);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r.page_id = Some(page);
        r.payload = RecordPayload::Update {
            offset,
            before,
            after,
        };
        r
    }

    /// Logical delete: the slot bytes are overwritten with a ghost marker.
    pub fn btree_ghost_mark(
        tid: Tid,
        prev_lsn: Lsn,
        page: PageId,
        offset: u16,
        before: Vec<u8>,
    ) -> Self {
        let after = vec![0u8; before.len()];
        let mut r = Self::new(RecordKind::BtreeGhostMark, FLAG_REDO | FLAG_UNDO);
        r.tid = tid;
        r.prev_lsn = prev_lsn;
        r.page_id = Some(page);
        r.payload = RecordPayload::Update {
            offset,
            before,
            after,
        };
        r
    }

    // ------------------------------------------------------------------
    // Flag accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn is_redo(&self) -> bool {
        self.flags & FLAG_REDO != 0
    }

    #[inline]
    pub fn is_undo(&self) -> bool {
        self.flags & FLAG_UNDO != 0
    }

    #[inline]
    pub fn is_cpsn(&self) -> bool {
        self.flags & FLAG_CPSN != 0
    }

    #[inline]
    pub fn is_single_sys_xct(&self) -> bool {
        self.flags & FLAG_SSX != 0
    }

    #[inline]
    pub fn is_multi_page(&self) -> bool {
        self.flags & FLAG_MULTI != 0
    }

    #[inline]
    pub fn is_page_alloc(&self) -> bool {
        self.flags & FLAG_ALLOC != 0
    }

    #[inline]
    pub fn is_page_dealloc(&self) -> bool {
        self.flags & FLAG_DEALLOC != 0
    }

    #[inline]
    pub fn is_skip(&self) -> bool {
        self.kind == RecordKind::Skip
    }

    pub fn has_tid(&self) -> bool {
        self.tid != 0
    }

    pub fn device_entry(&self) -> Option<&DevEntry> {
        match &self.payload {
            RecordPayload::Device(dev) => Some(dev),
            _ => None,
        }
    }

    /// Whether `pid` is one of the pages this record touches.
    pub fn touches(&self, pid: PageId) -> bool {
        self.page_id == Some(pid) || self.page_id2 == Some(pid)
    }

    // ------------------------------------------------------------------
    // Redo / undo dispatch
    // ------------------------------------------------------------------

    /// Apply this record's redo to `page`, which must be the frame for
    /// `target` (either of the record's page ids).
    pub fn redo(&self, target: PageId, page: &mut PageMut<'_>) -> Result<()> {
        ensure!(
            self.is_redo(),
            "redo invoked on a non-redoable {:?} record at {}",
            self.kind,
            self.lsn
        );
        match (&self.payload, self.kind) {
            (RecordPayload::Update { offset, after, .. }, _) => {
                page.write_body(*offset as usize, after)?;
            }
            (RecordPayload::Compensate { offset, data, .. }, _) => {
                page.write_body(*offset as usize, data)?;
            }
            (RecordPayload::None, RecordKind::PageImgFormat) => {
                page.format(target);
            }
            (RecordPayload::None, RecordKind::AllocPage | RecordKind::DeallocPage) => {
                // Allocation state lives in the volume metadata; the page
                // image itself is untouched.
            }
            (
                RecordPayload::NorecAlloc {
                    dest_offset,
                    dest_bytes,
                },
                RecordKind::BtreeNorecAlloc,
            ) => {
                if self.page_id == Some(target) {
                    page.write_body(*dest_offset as usize, dest_bytes)?;
                } else {
                    page.format(target);
                }
            }
            (payload, kind) => bail!(
                "no redo implementation for {:?} record with {:?} payload at {}",
                kind,
                payload_name(payload),
                self.lsn
            ),
        }
        Ok(())
    }

    /// Apply this record's undo (before-image) to `page`.
    pub fn undo(&self, _target: PageId, page: &mut PageMut<'_>) -> Result<()> {
        ensure!(
            self.is_undo(),
            "undo invoked on a non-undoable {:?} record at {}",
            self.kind,
            self.lsn
        );
        match &self.payload {
            RecordPayload::Update { offset, before, .. } => {
                page.write_body(*offset as usize, before)?;
            }
            _ => bail!(
                "no undo implementation for {:?} record at {}",
                self.kind,
                self.lsn
            ),
        }
        Ok(())
    }

    /// Bytes the undo of this record will splice back, with their offset.
    pub fn before_image(&self) -> Option<(u16, &[u8])> {
        match &self.payload {
            RecordPayload::Update { offset, before, .. } => Some((*offset, before.as_slice())),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------

    /// Encode with `lsn` stamped into the header and the checksum filled.
    pub fn encode(&self, lsn: Lsn) -> Result<Vec<u8>> {
        let payload = encode_payload(&self.payload);
        ensure!(
            payload.len() <= MAX_RECORD_SIZE,
            "log record payload of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_RECORD_SIZE
        );

        let mut header = RecordHeader::new_zeroed();
        header.kind = self.kind as u8;
        header.flags = self.flags;
        header.set_lsn(lsn.to_raw());
        header.set_length((RECORD_HEADER_SIZE + payload.len()) as u32);
        header.set_tid(self.tid);
        header.set_prev_lsn(self.prev_lsn.to_raw());
        if let Some(pid) = self.page_id {
            header.set_page_vol(pid.vol);
            header.set_page_store(pid.store);
            header.set_page_no(pid.page_no);
        }
        if let Some(pid) = self.page_id2 {
            header.set_page2_vol(pid.vol);
            header.set_page2_store(pid.store);
            header.set_page2_no(pid.page_no);
        }

        let mut bytes = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&payload);

        let checksum = record_checksum(&bytes);
        bytes[..8].copy_from_slice(&checksum.to_le_bytes());
        Ok(bytes)
    }

    /// Decode and validate one record. `bytes` must be exactly the record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= RECORD_HEADER_SIZE,
            "truncated log record: {} bytes",
            bytes.len()
        );
        let header = RecordHeader::read_from_bytes(&bytes[..RECORD_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("malformed log record header: {:?}", e))?;
        ensure!(
            header.length() as usize == bytes.len(),
            "log record length field {} does not match {} bytes read",
            header.length(),
            bytes.len()
        );

        let mut check_buf = bytes.to_vec();
        check_buf[..8].fill(0);
        let computed = record_checksum(&check_buf);
        ensure!(
            computed == header.checksum(),
            "log record checksum mismatch at {}",
            Lsn::from_raw(header.lsn())
        );

        let kind = RecordKind::from_u8(header.kind)?;
        let payload = decode_payload(kind, &bytes[RECORD_HEADER_SIZE..])?;

        let page_id = if header.page_no() != 0 {
            Some(PageId::new(
                header.page_vol(),
                header.page_store(),
                header.page_no(),
            ))
        } else {
            None
        };
        let page_id2 = if header.page2_no() != 0 {
            Some(PageId::new(
                header.page2_vol(),
                header.page2_store(),
                header.page2_no(),
            ))
        } else {
            None
        };

        Ok(Self {
            kind,
            flags: header.flags,
            lsn: Lsn::from_raw(header.lsn()),
            tid: header.tid(),
            prev_lsn: Lsn::from_raw(header.prev_lsn()),
            page_id,
            page_id2,
            payload,
            len: header.length(),
        })
    }
}

fn record_checksum(bytes: &[u8]) -> u64 {
    let mut digest = CRC64.digest();
    digest.update(bytes);
    digest.finalize()
}

fn payload_name(payload: &RecordPayload) -> &'static str {
    match payload {
        RecordPayload::None => "None",
        RecordPayload::Comment(_) => "Comment",
        RecordPayload::ChkptBegin { .. } => "ChkptBegin",
        RecordPayload::ChkptBufTab { .. } => "ChkptBufTab",
        RecordPayload::ChkptXctTab { .. } => "ChkptXctTab",
        RecordPayload::ChkptDevTab { .. } => "ChkptDevTab",
        RecordPayload::ChkptEnd { .. } => "ChkptEnd",
        RecordPayload::Device(_) => "Device",
        RecordPayload::XctList(_) => "XctList",
        RecordPayload::Compensate { .. } => "Compensate",
        RecordPayload::StoreOperation { .. } => "StoreOperation",
        RecordPayload::Update { .. } => "Update",
        RecordPayload::NorecAlloc { .. } => "NorecAlloc",
    }
}

// ----------------------------------------------------------------------
// Payload wire format
// ----------------------------------------------------------------------

fn encode_payload(payload: &RecordPayload) -> Vec<u8> {
    let mut out = Vec::new();
    match payload {
        RecordPayload::None => {}
        RecordPayload::Comment(text) => put_bytes(&mut out, text.as_bytes()),
        RecordPayload::ChkptBegin { last_mount_lsn } => put_lsn(&mut out, *last_mount_lsn),
        RecordPayload::ChkptBufTab { pages } => {
            put_u32(&mut out, pages.len() as u32);
            for (pid, rec_lsn) in pages {
                put_page_id(&mut out, *pid);
                put_lsn(&mut out, *rec_lsn);
            }
        }
        RecordPayload::ChkptXctTab { youngest, entries } => {
            put_u64(&mut out, *youngest);
            put_u32(&mut out, entries.len() as u32);
            for e in entries {
                put_u64(&mut out, e.tid);
                out.push(e.state as u8);
                put_lsn(&mut out, e.last_lsn);
                put_lsn(&mut out, e.first_lsn);
                put_lsn(&mut out, e.undo_next);
            }
        }
        RecordPayload::ChkptDevTab { devices } => {
            put_u32(&mut out, devices.len() as u32);
            for dev in devices {
                put_u32(&mut out, dev.vol);
                put_bytes(&mut out, dev.dev_name.as_bytes());
            }
        }
        RecordPayload::ChkptEnd {
            begin_chkpt,
            min_rec_lsn,
            min_xct_lsn,
        } => {
            put_lsn(&mut out, *begin_chkpt);
            put_lsn(&mut out, *min_rec_lsn);
            put_lsn(&mut out, *min_xct_lsn);
        }
        RecordPayload::Device(dev) => {
            put_u32(&mut out, dev.vol);
            put_bytes(&mut out, dev.dev_name.as_bytes());
        }
        RecordPayload::XctList(tids) => {
            put_u32(&mut out, tids.len() as u32);
            for tid in tids {
                put_u64(&mut out, *tid);
            }
        }
        RecordPayload::Compensate {
            undo_next,
            offset,
            data,
        } => {
            put_lsn(&mut out, *undo_next);
            put_u16(&mut out, *offset);
            put_bytes(&mut out, data);
        }
        RecordPayload::StoreOperation { vol, store, op } => {
            put_u32(&mut out, *vol);
            put_u32(&mut out, *store);
            out.push(*op);
        }
        RecordPayload::Update {
            offset,
            before,
            after,
        } => {
            put_u16(&mut out, *offset);
            put_bytes(&mut out, before);
            put_bytes(&mut out, after);
        }
        RecordPayload::NorecAlloc {
            dest_offset,
            dest_bytes,
        } => {
            put_u16(&mut out, *dest_offset);
            put_bytes(&mut out, dest_bytes);
        }
    }
    out
}

fn decode_payload(kind: RecordKind, bytes: &[u8]) -> Result<RecordPayload> {
    let mut r = Reader::new(bytes);
    let payload = match kind {
        RecordKind::Comment => {
            RecordPayload::Comment(String::from_utf8_lossy(r.take_bytes()?).into_owned())
        }
        RecordKind::Skip
        | RecordKind::XctEnd
        | RecordKind::XctAbort
        | RecordKind::XctFreeingSpace
        | RecordKind::AllocPage
        | RecordKind::DeallocPage
        | RecordKind::PageImgFormat => RecordPayload::None,
        RecordKind::ChkptBegin => RecordPayload::ChkptBegin {
            last_mount_lsn: r.take_lsn()?,
        },
        RecordKind::ChkptBufTab => {
            let count = r.take_u32()? as usize;
            let mut pages = Vec::with_capacity(count);
            for _ in 0..count {
                let pid = r.take_page_id()?;
                let rec_lsn = r.take_lsn()?;
                pages.push((pid, rec_lsn));
            }
            RecordPayload::ChkptBufTab { pages }
        }
        RecordKind::ChkptXctTab => {
            let youngest = r.take_u64()?;
            let count = r.take_u32()? as usize;
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let tid = r.take_u64()?;
                let state = XctState::from_u8(r.take_u8()?)?;
                let last_lsn = r.take_lsn()?;
                let first_lsn = r.take_lsn()?;
                let undo_next = r.take_lsn()?;
                entries.push(XctTabEntry {
                    tid,
                    state,
                    last_lsn,
                    first_lsn,
                    undo_next,
                });
            }
            RecordPayload::ChkptXctTab { youngest, entries }
        }
        RecordKind::ChkptDevTab => {
            let count = r.take_u32()? as usize;
            let mut devices = Vec::with_capacity(count);
            for _ in 0..count {
                let vol = r.take_u32()?;
                let name = String::from_utf8_lossy(r.take_bytes()?).into_owned();
                devices.push(DevEntry {
                    vol,
                    dev_name: name,
                });
            }
            RecordPayload::ChkptDevTab { devices }
        }
        RecordKind::ChkptEnd => RecordPayload::ChkptEnd {
            begin_chkpt: r.take_lsn()?,
            min_rec_lsn: r.take_lsn()?,
            min_xct_lsn: r.take_lsn()?,
        },
        RecordKind::Mount | RecordKind::Dismount => {
            let vol = r.take_u32()?;
            let name = String::from_utf8_lossy(r.take_bytes()?).into_owned();
            RecordPayload::Device(DevEntry {
                vol,
                dev_name: name,
            })
        }
        RecordKind::XctEndGroup => {
            let count = r.take_u32()? as usize;
            let mut tids = SmallVec::new();
            for _ in 0..count {
                tids.push(r.take_u64()?);
            }
            RecordPayload::XctList(tids)
        }
        RecordKind::Compensate => RecordPayload::Compensate {
            undo_next: r.take_lsn()?,
            offset: r.take_u16()?,
            data: r.take_bytes()?.to_vec(),
        },
        RecordKind::StoreOperation => RecordPayload::StoreOperation {
            vol: r.take_u32()?,
            store: r.take_u32()?,
            op: r.take_u8()?,
        },
        RecordKind::BtreeInsert | RecordKind::BtreeUpdate | RecordKind::BtreeGhostMark => {
            RecordPayload::Update {
                offset: r.take_u16()?,
                before: r.take_bytes()?.to_vec(),
                after: r.take_bytes()?.to_vec(),
            }
        }
        RecordKind::BtreeNorecAlloc => RecordPayload::NorecAlloc {
            dest_offset: r.take_u16()?,
            dest_bytes: r.take_bytes()?.to_vec(),
        },
    };
    Ok(payload)
}

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_lsn(out: &mut Vec<u8>, lsn: Lsn) {
    put_u64(out, lsn.to_raw());
}

fn put_page_id(out: &mut Vec<u8>, pid: PageId) {
    put_u32(out, pid.vol);
    put_u32(out, pid.store);
    put_u32(out, pid.page_no);
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.bytes.len(),
            "truncated log record payload: wanted {} bytes at offset {}, have {}",
            n,
            self.pos,
            self.bytes.len()
        );
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn take_lsn(&mut self) -> Result<Lsn> {
        Ok(Lsn::from_raw(self.take_u64()?))
    }

    fn take_page_id(&mut self) -> Result<PageId> {
        let vol = self.take_u32()?;
        let store = self.take_u32()?;
        let page_no = self.take_u32()?;
        Ok(PageId::new(vol, store, page_no))
    }

    fn take_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.take_u32()? as usize;
        self.take(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(record: LogRecord, lsn: Lsn) -> LogRecord {
        let bytes = record.encode(lsn).unwrap();
        LogRecord::decode(&bytes).unwrap()
    }

    #[test]
    fn update_record_round_trip() {
        let pid = PageId::new(1, 1, 42);
        let record = LogRecord::btree_update(
            7,
            Lsn::new(1, 64),
            pid,
            100,
            vec![1, 2, 3],
            vec![4, 5, 6],
        );
        let decoded = round_trip(record, Lsn::new(1, 128));

        assert_eq!(decoded.kind, RecordKind::BtreeUpdate);
        assert_eq!(decoded.lsn, Lsn::new(1, 128));
        assert_eq!(decoded.tid, 7);
        assert_eq!(decoded.prev_lsn, Lsn::new(1, 64));
        assert_eq!(decoded.page_id, Some(pid));
        assert!(decoded.is_redo() && decoded.is_undo());
        match decoded.payload {
            RecordPayload::Update {
                offset,
                before,
                after,
            } => {
                assert_eq!(offset, 100);
                assert_eq!(before, vec![1, 2, 3]);
                assert_eq!(after, vec![4, 5, 6]);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn checkpoint_end_round_trip() {
        let record = LogRecord::chkpt_end(Lsn::new(1, 0), Lsn::new(1, 0), Lsn::new(1, 512));
        let decoded = round_trip(record, Lsn::new(1, 1024));
        match decoded.payload {
            RecordPayload::ChkptEnd {
                begin_chkpt,
                min_rec_lsn,
                min_xct_lsn,
            } => {
                assert_eq!(begin_chkpt, Lsn::new(1, 0));
                assert_eq!(min_rec_lsn, Lsn::new(1, 0));
                assert_eq!(min_xct_lsn, Lsn::new(1, 512));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn multi_page_record_carries_both_pages() {
        let dest = PageId::new(1, 1, 10);
        let child = PageId::new(1, 1, 11);
        let record = LogRecord::btree_norec_alloc(dest, child, 0, vec![9, 9]);
        let decoded = round_trip(record, Lsn::new(2, 0));

        assert!(decoded.is_single_sys_xct());
        assert!(decoded.is_multi_page());
        assert_eq!(decoded.page_id, Some(dest));
        assert_eq!(decoded.page_id2, Some(child));
        assert!(decoded.touches(dest) && decoded.touches(child));
    }

    #[test]
    fn corrupted_record_is_rejected() {
        let record = LogRecord::comment("hello");
        let mut bytes = record.encode(Lsn::new(1, 0)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(LogRecord::decode(&bytes).is_err());
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let record = LogRecord::comment("x");
        let mut bytes = record.encode(Lsn::new(1, 0)).unwrap();
        bytes[20] = 0xEE; // kind byte
        bytes[..8].fill(0);
        let checksum = record_checksum(&bytes);
        bytes[..8].copy_from_slice(&checksum.to_le_bytes());
        let err = LogRecord::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("unknown log record kind"));
    }
}
