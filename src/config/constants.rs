//! # FenixDB Configuration Constants
//!
//! This module centralizes all configuration constants, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, fixed)
//!       │
//!       └─> PAGE_BODY_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!
//! RECORD_HEADER_SIZE (64 bytes)
//!       │
//!       └─> Every log record = header + variable payload.
//!           MAX_RECORD_SIZE bounds the payload so a record always fits
//!           inside one partition.
//!
//! MAX_LOG_PARTITION_SIZE (16 MB)
//!       │
//!       └─> Partition rotation threshold. Must exceed MAX_RECORD_SIZE
//!           plus one skip record or rotation could loop forever.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `PAGE_BODY_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE` (derived correctly)
//! 2. `MAX_RECORD_SIZE + RECORD_HEADER_SIZE < MAX_LOG_PARTITION_SIZE`
//!    (a record plus the skip sentinel always fits in a partition)
//! 3. `DEFAULT_POOL_FRAMES >= 2` (frame 0 is reserved, at least one usable)

// ============================================================================
// PAGE LAYOUT CONSTANTS
// These define the fundamental page structure used throughout the engine
// ============================================================================

/// Size of each database page in bytes (16KB).
/// This is the fundamental unit of I/O and buffering.
pub const PAGE_SIZE: usize = 16384;

/// Size of the page header in bytes.
/// Every page begins with this header containing checksum, page LSN and
/// identity fields.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Usable space in a page after the header.
pub const PAGE_BODY_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

const _: () = assert!(
    PAGE_BODY_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE,
    "PAGE_BODY_SIZE derivation mismatch"
);

// ============================================================================
// RECOVERY LOG CONFIGURATION
// ============================================================================

/// Size of the fixed log record header in bytes.
/// Each record = header + variable payload, checksummed as a unit.
pub const RECORD_HEADER_SIZE: usize = 64;

/// Maximum payload size of a single log record.
/// Large enough for a full page image plus framing.
pub const MAX_RECORD_SIZE: usize = PAGE_SIZE + 1024;

/// Maximum size of a single log partition file.
/// A skip record is written and a new partition opened past this point.
pub const MAX_LOG_PARTITION_SIZE: u64 = 16 * 1024 * 1024;

/// File name of the persisted master checkpoint record.
pub const MASTER_FILE_NAME: &str = "log.master";

const _: () = assert!(
    (MAX_RECORD_SIZE + 2 * RECORD_HEADER_SIZE) as u64 <= MAX_LOG_PARTITION_SIZE,
    "a maximum-size record plus the skip sentinel must fit in one partition"
);

// ============================================================================
// BUFFER POOL CONFIGURATION
// ============================================================================

/// Default number of page frames in the buffer pool, including the reserved
/// frame 0. Frame 0 is never handed out so that index 0 can mean "not found"
/// in the hash index, matching the free-list convention.
pub const DEFAULT_POOL_FRAMES: usize = 1024;

const _: () = assert!(
    DEFAULT_POOL_FRAMES >= 2,
    "buffer pool needs at least one usable frame besides the reserved frame 0"
);

// ============================================================================
// VOLUME CONFIGURATION
// ============================================================================

/// Page number of the store root page within each volume.
/// Page number 0 is the null page id and is never stored.
pub const ROOT_PAGE_NO: u32 = 1;

/// Number of pages a freshly created volume is formatted with.
pub const VOLUME_INITIAL_PAGES: u32 = 8;
