//! The journal engine: a circular append-only log of page-sized records over
//! a span of NAND blocks.
//!
//! Every sealed page carries a strictly increasing 64-bit id in its spare
//! header. That single counter is what makes the ring recoverable: the ring
//! wraps, so after any crash the newest page is found by scanning for the
//! largest valid id, never by physical position. Mounting repairs a
//! possibly-torn tail (stamping the leftover pages of the last block so they
//! can never masquerade as records) and erases the next block before
//! appending resumes.
//!
//! Media failures never surface to the caller as lost writes: a failed
//! program marks the block bad, moves its already-written pages into a fresh
//! block and retries. The only errors a caller sees are a ring too damaged
//! to mount and a ring that has run out of good blocks entirely.

pub mod header;
pub mod scan;

use thiserror::Error;

use crate::nand::Nand;
use crate::util::now_boot_us;
use self::header::{PageHeader, BAD_MARK_OFFSET, HEADER_SIZE, PAGE_ID_FIRST};

/// Minimum ring length in blocks
pub const MIN_RING_SIZE: u32 = 64;

/// Immutable placement of a ring on its device
#[derive(Debug, Copy, Clone)]
pub struct RingConfig {
    /// Index of the ring's first physical block
    pub start_blk: u32,

    /// Number of physical blocks in the ring
    pub len: u32,
}

/// Errors the ring reports to its caller.
///
/// Individual program/erase failures are handled internally and are *not*
/// represented here; these two cover a ring too degraded to keep going.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RingError {
    /// Fewer good blocks than the mount-time minimum
    #[error("ring has {good} good blocks, {} required", MIN_RING_SIZE / 2)]
    TooFewGoodBlocks { good: u32 },

    /// Every remaining block failed; the ring cannot make progress
    #[error("no good blocks remain in the ring")]
    Exhausted,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RingState {
    Idle,
    Mounted,
}

/// A journal ring bound to a NAND device.
///
/// Exactly one writer owns a ring; all operations are synchronous. Misusing
/// the lifecycle (writing while unmounted, stopping while mounted) is a
/// programmer error and panics.
#[derive(Debug)]
pub struct NandRing<N> {
    nand: N,
    cfg: RingConfig,
    state: RingState,
    cur_blk: u32,
    cur_page: u32,
    cur_id: u64,
    utc_correction: u32,
    scratch: Vec<u8>,
}

impl<N: Nand> NandRing<N> {
    /// Bind a ring to a device.
    ///
    /// Panics if the ring does not fit the device, is shorter than
    /// [`MIN_RING_SIZE`], or the spare area cannot hold the page header.
    pub fn start(nand: N, cfg: RingConfig) -> Self {
        let layout = nand.get_layout();
        assert!(
            cfg.len >= MIN_RING_SIZE,
            "ring of {} blocks, at least {MIN_RING_SIZE} required",
            cfg.len
        );
        assert!(
            cfg.start_blk + cfg.len <= layout.blocks,
            "ring overflows the device"
        );
        assert!(
            HEADER_SIZE <= layout.page_spare_size,
            "not enough room in spare area"
        );

        let scratch = vec![0u8; layout.page_size()];

        Self {
            nand,
            cfg,
            state: RingState::Idle,
            cur_blk: 0,
            cur_page: 0,
            cur_id: 0,
            utc_correction: 0,
            scratch,
        }
    }

    /// Recover the ring and make it writable.
    ///
    /// Scans for the most recently written page, closes out the previous
    /// session's tail block and erases the successor. An empty ring is
    /// formatted instead: the first good block becomes the tail and ids
    /// start from [`PAGE_ID_FIRST`].
    pub fn mount(&mut self) -> Result<(), RingError> {
        assert_eq!(self.state, RingState::Idle, "mount on a non-idle ring");

        let good = scan::total_good(&self.nand, &self.cfg);
        if good < MIN_RING_SIZE / 2 {
            return Err(RingError::TooFewGoodBlocks { good });
        }

        match scan::last_written_block(&self.nand, &self.cfg) {
            None => {
                self.cur_blk = self.mkfs()?;
                self.cur_id = PAGE_ID_FIRST;
            }
            Some(last_blk) => {
                let (last_page, last_id) = scan::last_written_page(&self.nand, last_blk);
                self.cur_blk = self.close_prev_session(last_blk, last_page)?;
                self.cur_id = last_id + 1;
            }
        }

        self.cur_page = 0;
        self.state = RingState::Mounted;
        Ok(())
    }

    /// Append one record: program `data` into the current page and seal it
    /// with a spare header carrying the next id.
    ///
    /// `data` must be exactly one data region long. A program failure on
    /// either region marks the block bad, moves the block's earlier pages
    /// into a fresh block and retries there with the same id; the caller
    /// only ever sees [`RingError::Exhausted`], when no good block is left
    /// to retry on.
    pub fn write_page(&mut self, data: &[u8]) -> Result<(), RingError> {
        assert_eq!(self.state, RingState::Mounted, "write on an unmounted ring");
        let layout = self.nand.get_layout();
        assert_eq!(
            data.len(),
            layout.page_data_size,
            "buffer must cover exactly one page"
        );

        loop {
            let page_ecc = match self.nand.write_page_data(self.cur_blk, self.cur_page, data) {
                Ok(ecc) => ecc,
                Err(_) => {
                    self.relocate()?;
                    continue;
                }
            };

            let header = PageHeader::seal(page_ecc, self.cur_id, self.utc_correction, now_boot_us());
            match self
                .nand
                .write_page_spare(self.cur_blk, self.cur_page, &header.into_bytes())
            {
                Ok(()) => break,
                Err(_) => {
                    self.relocate()?;
                    continue;
                }
            }
        }

        self.cur_id += 1;
        self.cur_page += 1;
        if self.cur_page == layout.pages_per_block {
            self.cur_page = 0;
            self.cur_blk = self.erase_next(self.cur_blk)?;
        }

        Ok(())
    }

    /// Count of good blocks in the ring span
    pub fn total_good(&self) -> u32 {
        assert_eq!(self.state, RingState::Mounted, "census on an unmounted ring");
        scan::total_good(&self.nand, &self.cfg)
    }

    /// Set the UTC offset stamped into the header of every subsequent page
    pub fn set_utc_correction(&mut self, correction: u32) {
        self.utc_correction = correction;
    }

    /// Stop appending. Touches no media: a ring that is unmounted and
    /// dropped leaves the flash exactly as a power cut would.
    pub fn umount(&mut self) {
        assert_eq!(self.state, RingState::Mounted, "umount on an unmounted ring");
        self.state = RingState::Idle;
    }

    /// Release the device. The ring must be idle.
    pub fn stop(self) -> N {
        assert_eq!(self.state, RingState::Idle, "stop on a non-idle ring");
        self.nand
    }

    /// Block currently being appended to (mounted rings only)
    pub fn cur_blk(&self) -> u32 {
        self.cur_blk
    }

    /// Next page index within [`Self::cur_blk`] to be written
    pub fn cur_page(&self) -> u32 {
        self.cur_page
    }

    /// Id that will be stamped on the next sealed page
    pub fn cur_id(&self) -> u64 {
        self.cur_id
    }

    pub fn config(&self) -> RingConfig {
        self.cfg
    }

    /// Read-only access to the underlying device
    pub fn nand(&self) -> &N {
        &self.nand
    }

    /// Format an empty ring: erase the first good block and make it the
    /// tail. An erase failure falls through to the next good block.
    fn mkfs(&mut self) -> Result<u32, RingError> {
        let first = scan::first_good(&self.nand, &self.cfg).ok_or(RingError::Exhausted)?;

        if self.nand.erase(first).is_ok() {
            return Ok(first);
        }
        self.nand.mark_bad(first);
        self.erase_next(first)
    }

    /// Erase the good block after `current`, marking failed candidates bad
    /// until one succeeds. The returned block is erased.
    fn erase_next(&mut self, current: u32) -> Result<u32, RingError> {
        let mut blk = current;

        loop {
            blk = scan::next_good(&self.nand, &self.cfg, blk).ok_or(RingError::Exhausted)?;
            match self.nand.erase(blk) {
                Ok(()) => return Ok(blk),
                Err(_) => self.nand.mark_bad(blk),
            }
        }
    }

    /// Overwrite the residual pages of the last session's tail block so no
    /// later mount can mistake them for records, then erase the successor
    /// block and return it as the new tail.
    ///
    /// The stamp (data zeroed, bad-mark bytes kept at `0xFF`, the rest of
    /// the header zeroed) can never carry a valid CRC, even over a page that
    /// was half-programmed when power went out. Stamp failures mark the
    /// block bad; the ring moves on regardless.
    fn close_prev_session(&mut self, last_blk: u32, last_page: u32) -> Result<u32, RingError> {
        let layout = self.nand.get_layout();
        let ppb = layout.pages_per_block;

        if last_page != ppb - 1 {
            self.scratch.fill(0);
            let bad_mark = layout.page_data_size + BAD_MARK_OFFSET;
            self.scratch[bad_mark..bad_mark + 2].fill(0xFF);

            for page in last_page + 1..ppb {
                if self
                    .nand
                    .write_page_whole(last_blk, page, &self.scratch)
                    .is_err()
                {
                    // A bad block is skipped by every future scan, so the
                    // remaining pages no longer need stamping.
                    self.nand.mark_bad(last_blk);
                    break;
                }
            }
        }

        self.erase_next(last_blk)
    }

    /// Current block failed a program: mark it bad and move its pages out
    fn relocate(&mut self) -> Result<(), RingError> {
        self.nand.mark_bad(self.cur_blk);
        self.cur_blk = self.rescue(self.cur_blk, self.cur_page)?;
        Ok(())
    }

    /// Move the written pages `[0, failed_page)` of a failing block into a
    /// fresh erased block and return it. A move failure marks the *target*
    /// bad and tries the next block. With `failed_page == 0` there is
    /// nothing to preserve and a fresh block is simply allocated.
    fn rescue(&mut self, failed_blk: u32, failed_page: u32) -> Result<u32, RingError> {
        if failed_page == 0 {
            return self.erase_next(failed_blk);
        }

        loop {
            let target = self.erase_next(failed_blk)?;
            match self
                .nand
                .data_move(failed_blk, target, failed_page, &mut self.scratch)
            {
                Ok(()) => return Ok(target),
                Err(_) => self.nand.mark_bad(target),
            }
        }
    }
}
