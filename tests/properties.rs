//! Property tests driving the ring through random workloads, injected media
//! faults and simulated power cuts.

use std::collections::HashSet;

use proptest::prelude::*;

use nand_ring::nand::{Nand, NandLayout, PageUtil, SimNand};
use nand_ring::ring::header::BAD_MARK_OFFSET;
use nand_ring::ring::{scan, NandRing, RingConfig};

const LAYOUT: NandLayout = NandLayout {
    blocks: 64,
    pages_per_block: 8,
    page_data_size: 128,
    page_spare_size: 64,
};

const CFG: RingConfig = RingConfig {
    start_blk: 0,
    len: 64,
};

fn payload(id: u64) -> Vec<u8> {
    vec![id as u8; LAYOUT.page_data_size]
}

fn crash<N: Nand>(mut ring: NandRing<N>) -> N {
    ring.umount();
    ring.stop()
}

/// Every `(block, valid pages, ids)` triple of the good blocks in the ring
fn survey(nand: &impl Nand) -> Vec<(u32, Vec<Option<u64>>)> {
    (CFG.start_blk..CFG.start_blk + CFG.len)
        .filter(|&b| !nand.is_bad(b))
        .map(|b| {
            let ids = (0..LAYOUT.pages_per_block)
                .map(|p| scan::read_page_id(nand, b, p).valid())
                .collect();
            (b, ids)
        })
        .collect()
}

fn arm_faults(nand: &mut SimNand, programs: &[(u32, u32)], erases: &[u32]) {
    for &(block, page) in programs {
        nand.fail_next_program(block, page);
    }
    for &block in erases {
        nand.fail_next_erase(block);
    }
}

fn program_faults() -> impl Strategy<Value = Vec<(u32, u32)>> {
    prop::collection::vec((0..LAYOUT.blocks, 0..LAYOUT.pages_per_block), 0..12)
}

fn erase_faults() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(0..LAYOUT.blocks, 0..6)
}

proptest! {
    /// Durable ids are unique, bounded by the append count, and strictly
    /// increasing within each block's valid prefix; the payload read back
    /// under an id is the payload appended under it.
    #[test]
    fn monotonic_ids_under_faults(
        writes in 1usize..600,
        programs in program_faults(),
        erases in erase_faults(),
    ) {
        let mut nand = SimNand::new(LAYOUT);
        arm_faults(&mut nand, &programs, &erases);

        let mut ring = NandRing::start(nand, CFG);
        ring.mount().unwrap();
        for id in 1..=writes as u64 {
            ring.write_page(&payload(id)).unwrap();
        }
        prop_assert_eq!(ring.cur_id(), writes as u64 + 1);
        let nand = crash(ring);

        let mut seen = HashSet::new();
        let mut data = vec![0u8; LAYOUT.page_data_size];
        for (block, ids) in survey(&nand) {
            let mut prev = None;
            for (page, id) in ids.into_iter().enumerate() {
                let Some(id) = id else { continue };

                prop_assert!(id <= writes as u64, "id {id} was never appended");
                prop_assert!(seen.insert(id), "id {id} appears twice");
                if let Some(prev) = prev {
                    prop_assert!(id > prev, "ids not increasing within block {block}");
                }
                prev = Some(id);

                nand.read_page_data(block, page as u32, &mut data).unwrap();
                prop_assert_eq!(&data, &payload(id), "payload mismatch for id {}", id);
            }
        }
    }

    /// After a power cut, a remount resumes from exactly one past the
    /// newest durable id, on a fully erased tail block.
    #[test]
    fn recovery_converges(
        writes in 0usize..600,
        programs in program_faults(),
        erases in erase_faults(),
    ) {
        let mut nand = SimNand::new(LAYOUT);
        arm_faults(&mut nand, &programs, &erases);

        let mut ring = NandRing::start(nand, CFG);
        ring.mount().unwrap();
        for id in 1..=writes as u64 {
            ring.write_page(&payload(id)).unwrap();
        }
        let before = ring.cur_id();
        let nand = crash(ring);

        let mut ring = NandRing::start(nand, CFG);
        ring.mount().unwrap();
        prop_assert_eq!(ring.cur_id(), before);
        prop_assert_eq!(ring.cur_page(), 0);

        let tail = ring.cur_blk();
        prop_assert!(!ring.nand().is_bad(tail));
        let mut data = vec![0u8; LAYOUT.page_data_size];
        let mut spare = vec![0u8; LAYOUT.page_spare_size];
        for page in 0..LAYOUT.pages_per_block {
            ring.nand().read_page_data(tail, page, &mut data).unwrap();
            ring.nand().read_page_spare(tail, page, &mut spare).unwrap();
            prop_assert!(data.is_erased() && spare.is_erased(), "tail block not erased");
        }
    }

    /// CRC-valid pages always form a contiguous prefix of their block
    #[test]
    fn valid_pages_form_block_prefix(
        writes in 1usize..600,
        programs in program_faults(),
        erases in erase_faults(),
        remount in proptest::bool::ANY,
    ) {
        let mut nand = SimNand::new(LAYOUT);
        arm_faults(&mut nand, &programs, &erases);

        let mut ring = NandRing::start(nand, CFG);
        ring.mount().unwrap();
        for id in 1..=writes as u64 {
            ring.write_page(&payload(id)).unwrap();
        }
        let mut nand = crash(ring);

        if remount {
            let mut ring = NandRing::start(nand, CFG);
            ring.mount().unwrap();
            nand = crash(ring);
        }

        for (block, ids) in survey(&nand) {
            let valid_then_wasted = ids
                .iter()
                .skip_while(|id| id.is_some())
                .all(|id| id.is_none());
            prop_assert!(valid_then_wasted, "holes in block {}", block);
        }
    }

    /// A mount that interrupts a previous tail repair converges to the same
    /// state as an uninterrupted one, however far the repair got.
    #[test]
    fn interrupted_close_is_idempotent(
        writes in 1u32..8,
        stamped in 0u32..8,
    ) {
        let mut ring = NandRing::start(SimNand::new(LAYOUT), CFG);
        ring.mount().unwrap();
        for id in 1..=u64::from(writes) {
            ring.write_page(&payload(id)).unwrap();
        }
        let pristine = crash(ring);

        // The uninterrupted repair
        let mut ring = NandRing::start(pristine.clone(), CFG);
        ring.mount().unwrap();
        let expected = (ring.cur_blk(), ring.cur_id());

        // The interrupted one: some residual pages already stamped by the
        // mount that lost power
        let mut nand = pristine;
        let mut stamp = vec![0u8; LAYOUT.page_size()];
        stamp[LAYOUT.page_data_size + BAD_MARK_OFFSET..][..2].fill(0xFF);
        let first_residual = writes;
        let last_residual = (first_residual + stamped).min(LAYOUT.pages_per_block);
        for page in first_residual..last_residual {
            nand.write_page_whole(0, page, &stamp).unwrap();
        }

        let mut ring = NandRing::start(nand, CFG);
        ring.mount().unwrap();
        prop_assert_eq!((ring.cur_blk(), ring.cur_id()), expected);
    }

    /// No block the driver reports bad is ever programmed, erased, or the
    /// target of a data move. The auditing device panics otherwise.
    #[test]
    fn bad_blocks_are_never_touched(
        first in 1usize..400,
        second in 1usize..400,
        programs in program_faults(),
        erases in erase_faults(),
    ) {
        let mut nand = SimNand::new(LAYOUT);
        arm_faults(&mut nand, &programs, &erases);

        let mut ring = NandRing::start(Audit(nand), CFG);
        ring.mount().unwrap();
        for id in 1..=first as u64 {
            ring.write_page(&payload(id)).unwrap();
        }
        let nand = crash(ring);

        let mut ring = NandRing::start(nand, CFG);
        ring.mount().unwrap();
        for id in 1..=second as u64 {
            ring.write_page(&payload(id)).unwrap();
        }
        crash(ring);
    }
}

/// Delegating device that asserts destructive operations never land on a
/// block already marked bad.
#[derive(Debug)]
struct Audit(SimNand);

impl Audit {
    fn check(&self, block: u32, what: &str) {
        assert!(!self.0.is_bad(block), "{what} on bad block {block}");
    }
}

impl Nand for Audit {
    fn get_layout(&self) -> NandLayout {
        self.0.get_layout()
    }

    fn is_bad(&self, block: u32) -> bool {
        self.0.is_bad(block)
    }

    fn mark_bad(&mut self, block: u32) {
        self.0.mark_bad(block)
    }

    fn erase(&mut self, block: u32) -> anyhow::Result<()> {
        self.check(block, "erase");
        self.0.erase(block)
    }

    fn read_page_data(&self, block: u32, page: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        self.0.read_page_data(block, page, buf)
    }

    fn read_page_spare(&self, block: u32, page: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        self.0.read_page_spare(block, page, buf)
    }

    fn write_page_data(&mut self, block: u32, page: u32, data: &[u8]) -> anyhow::Result<u32> {
        self.check(block, "program");
        self.0.write_page_data(block, page, data)
    }

    fn write_page_spare(&mut self, block: u32, page: u32, spare: &[u8]) -> anyhow::Result<()> {
        self.check(block, "program");
        self.0.write_page_spare(block, page, spare)
    }

    fn write_page_whole(&mut self, block: u32, page: u32, buf: &[u8]) -> anyhow::Result<()> {
        self.check(block, "program");
        self.0.write_page_whole(block, page, buf)
    }

    fn data_move(
        &mut self,
        src: u32,
        dst: u32,
        pages: u32,
        scratch: &mut [u8],
    ) -> anyhow::Result<()> {
        self.check(dst, "data move");
        self.0.data_move(src, dst, pages, scratch)
    }
}
