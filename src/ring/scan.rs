//! Read-only scans over the ring: good-block iteration and the mount-time
//! search for the most recently written page.
//!
//! The ring wraps, so physical position does not encode temporal order; the
//! monotonically increasing page id does. A brute-force scan of first pages
//! is acceptable because it only runs at mount and the ring length is
//! bounded.

use super::header::{PageHeader, PageId, HEADER_SIZE};
use super::RingConfig;
use crate::nand::Nand;

/// Count the good blocks in the ring span
pub fn total_good<N: Nand>(nand: &N, cfg: &RingConfig) -> u32 {
    (cfg.start_blk..cfg.start_blk + cfg.len)
        .filter(|&b| !nand.is_bad(b))
        .count() as u32
}

/// Walk forward from `current + 1`, wrapping at the end of the ring, to the
/// first block the driver does not report bad.
///
/// The walk ends on `current` itself, so a ring whose only good block is
/// `current` yields `Some(current)` again; `None` means the wrap completed
/// without finding any good block.
pub fn next_good<N: Nand>(nand: &N, cfg: &RingConfig, current: u32) -> Option<u32> {
    let mut b = current;

    loop {
        b += 1;
        if b == cfg.start_blk + cfg.len {
            b = cfg.start_blk;
        }
        if !nand.is_bad(b) {
            return Some(b);
        }
        if b == current {
            return None;
        }
    }
}

/// The first good block of the ring
pub fn first_good<N: Nand>(nand: &N, cfg: &RingConfig) -> Option<u32> {
    next_good(nand, cfg, cfg.start_blk + cfg.len - 1)
}

/// Read a page's spare header and reduce it to its id.
///
/// A read error or a CRC mismatch both come back [`PageId::Wasted`]; during
/// recovery an unreadable page and a never-written page mean the same thing.
pub fn read_page_id<N: Nand>(nand: &N, block: u32, page: u32) -> PageId {
    let mut spare = [0u8; HEADER_SIZE];

    if nand.read_page_spare(block, page, &mut spare).is_err() {
        return PageId::Wasted;
    }

    match PageHeader::decode(&spare) {
        Some(header) => header.page_id(),
        None => PageId::Wasted,
    }
}

/// Find the last written block by brute force, starting from the first good
/// block of the ring.
///
/// Reads page 0 of every good block and tracks the largest valid id; equal
/// ids prefer the later-visited block, so a close-out that was interrupted
/// between two blocks converges the same way on every mount. `None` means no
/// block holds a valid page and the ring is empty.
pub fn last_written_block<N: Nand>(nand: &N, cfg: &RingConfig) -> Option<u32> {
    let first = first_good(nand, cfg)?;
    let rpt = howudoin::new()
        .label("Scanning ring")
        .set_len(u64::from(cfg.len));

    let mut last: Option<(u32, u64)> = None;

    let mut b = first;
    loop {
        rpt.inc();
        if let PageId::Valid(id) = read_page_id(nand, b, 0) {
            if last.map_or(true, |(_, max)| id >= max) {
                last = Some((b, id));
            }
        }

        b = match next_good(nand, cfg, b) {
            Some(x) => x,
            None => break,
        };
        if b == first {
            break;
        }
    }

    rpt.close();

    last.map(|(block, _)| block)
}

/// Find the last written page within the last written block.
///
/// Returns the page index and the id sealed on it. The caller must pass a
/// block found by [`last_written_block`], which guarantees at least page 0
/// carries a valid id.
pub fn last_written_page<N: Nand>(nand: &N, block: u32) -> (u32, u64) {
    let ppb = nand.get_layout().pages_per_block;

    let mut last: Option<(u32, u64)> = None;
    for page in 0..ppb {
        if let PageId::Valid(id) = read_page_id(nand, block, page) {
            if last.map_or(true, |(_, max)| id >= max) {
                last = Some((page, id));
            }
        }
    }

    last.expect("last written block holds no sealed page")
}
