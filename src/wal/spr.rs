//! # Single-Page Repair
//!
//! Reconstructs one page by replaying only that page's log records, up to
//! an expected last-write LSN (`emlsn`). Used by Redo when a page read
//! back from its volume is corrupted (bad checksum) or has never been
//! flushed (virgin), and by the page-driven Redo strategy for every
//! in-doubt page.
//!
//! The walk is a forward scan over the whole log; records are applied when
//! they touch the page and fall in `(page.lsn, emlsn]`. Analysis
//! guarantees that the first log record for a never-flushed page is
//! virgin-producing (a page format, or the second page of a no-record
//! split), so replay from a null page LSN rebuilds the image from nothing.
//! Compensation records are redo-only and replay like any other update, so
//! a page that was mid-rollback at the crash converges to the same state
//! forward processing had reached.

use eyre::{ensure, Result};
use log::{debug, trace};

use crate::storage::page::PageMut;
use crate::storage::PageId;
use crate::wal::{LogManager, Lsn};

/// Replay `pid`'s records in `(page.lsn, emlsn]` onto `page`.
///
/// With `actual_emlsn` set, `emlsn` is known to be the page's true
/// last-write LSN (Analysis staged it), and finishing anywhere else is
/// log corruption.
pub fn recover_single_page(
    log: &LogManager,
    pid: PageId,
    page: &mut PageMut<'_>,
    emlsn: Lsn,
    actual_emlsn: bool,
) -> Result<()> {
    ensure!(!pid.is_null(), "single-page repair needs a real page id");
    debug!(
        "single-page repair for {} from {} up to {}",
        pid,
        page.lsn(),
        emlsn
    );

    let mut applied = 0usize;
    let mut cursor = log.open_scan(Lsn::new(1, 0), true);
    while let Some((lsn, record)) = cursor.next()? {
        if lsn > emlsn {
            break;
        }
        if !record.is_redo() || !record.touches(pid) {
            continue;
        }
        if lsn <= page.lsn() {
            continue;
        }
        trace!("repair {}: applying {:?} at {}", pid, record.kind, lsn);
        record.redo(pid, page)?;
        page.set_lsn(lsn);
        applied += 1;
    }

    if applied == 0 {
        debug!("repair {}: nothing to replay", pid);
    }
    if actual_emlsn {
        ensure!(
            page.lsn() == emlsn,
            "single-page repair for {} ended at {} instead of the expected {}",
            pid,
            page.lsn(),
            emlsn
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use crate::storage::page::PageBuf;
    use crate::wal::LogRecord;
    use tempfile::tempdir;

    #[test]
    fn repair_rebuilds_a_page_from_its_records() {
        let dir = tempdir().unwrap();
        let log = LogManager::create(dir.path()).unwrap();
        let pid = PageId::new(1, 1, 5);
        let other = PageId::new(1, 1, 6);

        log.insert(&LogRecord::page_img_format(3, Lsn::NULL, pid))
            .unwrap();
        log.insert(&LogRecord::btree_insert(3, Lsn::NULL, other, 0, vec![9]))
            .unwrap();
        let l2 = log
            .insert(&LogRecord::btree_insert(3, Lsn::NULL, pid, 4, vec![1, 2]))
            .unwrap();
        let l3 = log
            .insert(&LogRecord::btree_update(
                3,
                Lsn::NULL,
                pid,
                4,
                vec![1, 2],
                vec![7, 8],
            ))
            .unwrap();
        log.flush_all().unwrap();

        let mut buf: PageBuf = [0u8; PAGE_SIZE];
        let mut page = PageMut::new(&mut buf);
        recover_single_page(&log, pid, &mut page, l3, true).unwrap();

        assert_eq!(page.lsn(), l3);
        assert_eq!(&page.body()[4..6], &[7, 8]);

        // Repair up to an intermediate LSN replays a prefix only.
        let mut buf2: PageBuf = [0u8; PAGE_SIZE];
        let mut page2 = PageMut::new(&mut buf2);
        recover_single_page(&log, pid, &mut page2, l2, true).unwrap();
        assert_eq!(page2.lsn(), l2);
        assert_eq!(&page2.body()[4..6], &[1, 2]);
    }

    #[test]
    fn repair_to_wrong_emlsn_is_an_error() {
        let dir = tempdir().unwrap();
        let log = LogManager::create(dir.path()).unwrap();
        let pid = PageId::new(1, 1, 5);
        log.insert(&LogRecord::page_img_format(3, Lsn::NULL, pid))
            .unwrap();
        let end = log.insert(&LogRecord::comment("unrelated")).unwrap();
        log.flush_all().unwrap();

        let mut buf: PageBuf = [0u8; PAGE_SIZE];
        let mut page = PageMut::new(&mut buf);
        assert!(recover_single_page(&log, pid, &mut page, end, true).is_err());
    }
}
