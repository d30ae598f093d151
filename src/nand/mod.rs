//! Abstractions and code to access raw NAND flash.
//!
//! Pages are split into a *data* region and an out-of-band *spare* region;
//! both can be programmed independently (once) between erases. All driver
//! operations are addressed by `(block, page)` index because the journal
//! routinely touches two blocks at once, e.g. when moving a half-written
//! block's contents away from a failing die.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub page_data_size: usize,
    pub page_spare_size: usize,
}

impl NandLayout {
    /// Data + spare bytes of a single page
    pub fn page_size(&self) -> usize {
        self.page_data_size + self.page_spare_size
    }
}

/// Parse strings like "BLOCKSxPAGESxDATA+SPARE", e.g. "64x64x2048+64"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let [blocks, pages_per_block, page]: [&str; 3] = s
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#+#"))?;
        let [data, spare]: [&str; 2] = page
            .split('+')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#+#"))?;

        Ok(NandLayout {
            blocks: blocks.parse()?,
            pages_per_block: pages_per_block.parse()?,
            page_data_size: data.parse()?,
            page_spare_size: spare.parse()?,
        })
    }
}

/// Represents a NAND flash device
///
/// Program and erase operations return `Err` when the device reports a
/// failed status; callers are expected to treat that as a media event
/// (mark the block bad, move the data elsewhere), not as a bug.
pub trait Nand {
    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Has this block been marked unreliable?
    fn is_bad(&self, block: u32) -> bool;

    /// Mark a block unreliable. Reading it may still work; programming and
    /// erasing it must never be attempted again.
    fn mark_bad(&mut self, block: u32);

    /// Erase a block, returning every page to the all-1s state
    fn erase(&mut self, block: u32) -> anyhow::Result<()>;

    /// Read up to a full data region into `buf`
    fn read_page_data(&self, block: u32, page: u32, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Read up to a full spare region into `buf`
    fn read_page_spare(&self, block: u32, page: u32, buf: &mut [u8]) -> anyhow::Result<()>;

    /// Program the data region, returning the device-computed ECC
    fn write_page_data(&mut self, block: u32, page: u32, data: &[u8]) -> anyhow::Result<u32>;

    /// Program the spare region
    fn write_page_spare(&mut self, block: u32, page: u32, spare: &[u8]) -> anyhow::Result<()>;

    /// Program data and spare regions in one operation, without any
    /// device-side ECC bookkeeping. `buf` covers both regions.
    fn write_page_whole(&mut self, block: u32, page: u32, buf: &[u8]) -> anyhow::Result<()>;

    /// Copy the first `pages` whole pages of `src` into `dst`, page by page,
    /// through `scratch` (at least one whole page long). Spare contents are
    /// carried over verbatim; `dst` must be erased.
    fn data_move(
        &mut self,
        src: u32,
        dst: u32,
        pages: u32,
        scratch: &mut [u8],
    ) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
///
/// Programming follows real NAND semantics: bits can only be cleared, so a
/// program ANDs the new content into the page. Failures can be injected
/// one-shot per `(block, page)` program or per-block erase.
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    program_faults: HashSet<(u32, u32)>,
    erase_faults: HashSet<u32>,
}

#[derive(Debug, Clone)]
struct SimBlock {
    pages: Vec<SimPage>,
    marked_bad: bool,
}

#[derive(Debug, Clone)]
struct SimPage {
    data: Vec<u8>,
    spare: Vec<u8>,
}

impl SimPage {
    fn erased(layout: NandLayout) -> Self {
        Self {
            data: vec![0xFF; layout.page_data_size],
            spare: vec![0xFF; layout.page_spare_size],
        }
    }
}

impl SimBlock {
    fn new(layout: NandLayout) -> Self {
        Self {
            pages: vec![SimPage::erased(layout); layout.pages_per_block as usize],
            marked_bad: false,
        }
    }
}

/// NAND can only clear bits until the next erase
fn program_bytes(cell: &mut [u8], content: &[u8]) {
    for (c, &x) in cell.iter_mut().zip(content) {
        *c &= x;
    }
}

impl SimNand {
    /// Create a fully-erased SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize].into_boxed_slice();

        Self {
            blocks,
            layout,
            program_faults: HashSet::new(),
            erase_faults: HashSet::new(),
        }
    }

    /// Make the next program of `(block, page)` report a failed status
    pub fn fail_next_program(&mut self, block: u32, page: u32) {
        self.program_faults.insert((block, page));
    }

    /// Make the next erase of `block` report a failed status
    pub fn fail_next_erase(&mut self, block: u32) {
        self.erase_faults.insert(block);
    }

    fn block(&self, block: u32) -> anyhow::Result<&SimBlock> {
        self.blocks
            .get(block as usize)
            .ok_or(anyhow::anyhow!("block {block} out of range"))
    }

    fn page_mut(&mut self, block: u32, page: u32) -> anyhow::Result<&mut SimPage> {
        let blk = self
            .blocks
            .get_mut(block as usize)
            .ok_or(anyhow::anyhow!("block {block} out of range"))?;
        ensure!(!blk.marked_bad, "program on block {block} marked bad");
        blk.pages
            .get_mut(page as usize)
            .ok_or(anyhow::anyhow!("page {page} out of bounds"))
    }

    fn check_program_fault(&mut self, block: u32, page: u32) -> anyhow::Result<()> {
        if self.program_faults.remove(&(block, page)) {
            bail!("program failed at block {block} page {page}");
        }
        Ok(())
    }

    /// Initialize the NAND contents with a raw image read from a type
    /// implementing `Read`. Blocks filled entirely with `0xBD` (the marker
    /// [`save`](Self::save) emits) come back marked bad.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.page_size()];

        for block in self.blocks.iter_mut() {
            block.marked_bad = true;
            for page in block.pages.iter_mut() {
                read.read_exact(&mut buf)?;
                if !buf.iter().all(|&x| x == 0xBD) {
                    block.marked_bad = false;
                }
                page.data.copy_from_slice(&buf[..self.layout.page_data_size]);
                page.spare.copy_from_slice(&buf[self.layout.page_data_size..]);
            }
            if block.marked_bad {
                for page in block.pages.iter_mut() {
                    *page = SimPage::erased(self.layout);
                }
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream
    /// (such as a File). Bad blocks are emitted as `0xBD` fill.
    pub fn save<W: Write>(&self, write: &mut W) -> anyhow::Result<()> {
        let bad_fill = vec![0xBD; self.layout.page_size()];

        for block in self.blocks.iter() {
            for page in block.pages.iter() {
                if block.marked_bad {
                    write.write_all(&bad_fill)?;
                } else {
                    write.write_all(&page.data)?;
                    write.write_all(&page.spare)?;
                }
            }
        }

        Ok(())
    }
}

impl Nand for SimNand {
    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn is_bad(&self, block: u32) -> bool {
        self.blocks[block as usize].marked_bad
    }

    fn mark_bad(&mut self, block: u32) {
        // Contents stay readable so that still-good pages can be moved out.
        self.blocks[block as usize].marked_bad = true;
    }

    fn erase(&mut self, block: u32) -> anyhow::Result<()> {
        if self.erase_faults.remove(&block) {
            bail!("erase failed at block {block}");
        }

        let layout = self.layout;
        let blk = self
            .blocks
            .get_mut(block as usize)
            .ok_or(anyhow::anyhow!("block {block} out of range"))?;
        ensure!(!blk.marked_bad, "erase on block {block} marked bad");
        for page in blk.pages.iter_mut() {
            *page = SimPage::erased(layout);
        }
        Ok(())
    }

    fn read_page_data(&self, block: u32, page: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let blk = self.block(block)?;
        let page = blk
            .pages
            .get(page as usize)
            .ok_or(anyhow::anyhow!("page {page} out of bounds"))?;
        ensure!(buf.len() <= page.data.len(), "read beyond data region");
        buf.copy_from_slice(&page.data[..buf.len()]);
        Ok(())
    }

    fn read_page_spare(&self, block: u32, page: u32, buf: &mut [u8]) -> anyhow::Result<()> {
        let blk = self.block(block)?;
        let page = blk
            .pages
            .get(page as usize)
            .ok_or(anyhow::anyhow!("page {page} out of bounds"))?;
        ensure!(buf.len() <= page.spare.len(), "read beyond spare region");
        buf.copy_from_slice(&page.spare[..buf.len()]);
        Ok(())
    }

    fn write_page_data(&mut self, block: u32, page: u32, data: &[u8]) -> anyhow::Result<u32> {
        self.check_program_fault(block, page)?;
        let cell = self.page_mut(block, page)?;
        ensure!(data.len() <= cell.data.len(), "program beyond data region");
        program_bytes(&mut cell.data, data);

        // Stand-in for the device ECC engine; the journal treats it as opaque.
        let ecc = data
            .iter()
            .fold(0u32, |acc, &b| acc.rotate_left(5) ^ u32::from(b));
        Ok(ecc)
    }

    fn write_page_spare(&mut self, block: u32, page: u32, spare: &[u8]) -> anyhow::Result<()> {
        self.check_program_fault(block, page)?;
        let cell = self.page_mut(block, page)?;
        ensure!(spare.len() <= cell.spare.len(), "program beyond spare region");
        program_bytes(&mut cell.spare, spare);
        Ok(())
    }

    fn write_page_whole(&mut self, block: u32, page: u32, buf: &[u8]) -> anyhow::Result<()> {
        self.check_program_fault(block, page)?;
        let data_size = self.layout.page_data_size;
        let cell = self.page_mut(block, page)?;
        ensure!(
            buf.len() <= data_size + cell.spare.len(),
            "program beyond page"
        );
        let (data, spare) = buf.split_at(data_size.min(buf.len()));
        program_bytes(&mut cell.data, data);
        program_bytes(&mut cell.spare, spare);
        Ok(())
    }

    fn data_move(
        &mut self,
        src: u32,
        dst: u32,
        pages: u32,
        scratch: &mut [u8],
    ) -> anyhow::Result<()> {
        let layout = self.layout;
        ensure!(
            scratch.len() >= layout.page_size(),
            "scratch smaller than a page"
        );
        ensure!(!self.is_bad(dst), "data move into block {dst} marked bad");

        for page in 0..pages {
            let whole = &mut scratch[..layout.page_size()];
            let (data, spare) = whole.split_at_mut(layout.page_data_size);
            self.read_page_data(src, page, data)?;
            self.read_page_spare(src, page, spare)?;
            self.write_page_whole(dst, page, &scratch[..layout.page_size()])?;
        }

        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    page_data_size: 256,
    page_spare_size: 64,
};

#[test]
fn test_layout_parse() {
    let layout: NandLayout = "64x64x2048+64".parse().unwrap();
    assert_eq!(
        layout,
        NandLayout {
            blocks: 64,
            pages_per_block: 64,
            page_data_size: 2048,
            page_spare_size: 64,
        }
    );
    assert!("64x64x2048".parse::<NandLayout>().is_err());
    assert!("64x2048+64".parse::<NandLayout>().is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(!nand.is_bad(0));
    nand.mark_bad(0);
    assert!(nand.is_bad(0));
    assert!(nand.erase(0).is_err());
    assert!(nand.write_page_data(0, 0, &[0xA5; 256]).is_err());

    // Bad blocks stay readable
    let mut buf = [0u8; 256];
    nand.read_page_data(0, 0, &mut buf).unwrap();
    assert!(buf.is_erased());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; TEST_LAYOUT.page_data_size];
    let mut data_out = data_in.clone();

    nand.write_page_data(0, 2, &data_in).unwrap();
    nand.read_page_data(0, 2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    // The spare region is untouched by a data program
    let mut spare = vec![0u8; TEST_LAYOUT.page_spare_size];
    nand.read_page_spare(0, 2, &mut spare).unwrap();
    assert!(spare.is_erased());

    nand.write_page_spare(0, 2, &[0x5A; 64]).unwrap();
    nand.read_page_spare(0, 2, &mut spare).unwrap();
    assert_eq!(spare, [0x5A; 64]);

    // Neighbouring pages unaffected
    nand.read_page_data(0, 3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_program_clears_bits_only() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    nand.write_page_data(1, 0, &[0xF0; 256]).unwrap();
    nand.write_page_data(1, 0, &[0x0F; 256]).unwrap();

    let mut buf = [0u8; 256];
    nand.read_page_data(1, 0, &mut buf).unwrap();
    assert_eq!(buf, [0x00; 256]);

    nand.erase(1).unwrap();
    nand.read_page_data(1, 0, &mut buf).unwrap();
    assert!(buf.is_erased());
}

#[test]
fn test_sim_fault_injection() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    nand.fail_next_program(0, 1);
    assert!(nand.write_page_data(0, 1, &[0u8; 256]).is_err());
    // One-shot: the retry succeeds
    assert!(nand.write_page_data(0, 1, &[0u8; 256]).is_ok());

    nand.fail_next_erase(3);
    assert!(nand.erase(3).is_err());
    assert!(nand.erase(3).is_ok());
}

#[test]
fn test_sim_data_move() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut scratch = vec![0u8; TEST_LAYOUT.page_size()];

    for page in 0..4u32 {
        nand.write_page_data(0, page, &[page as u8; 256]).unwrap();
        nand.write_page_spare(0, page, &[0xF0 | page as u8; 64]).unwrap();
    }

    nand.data_move(0, 5, 4, &mut scratch).unwrap();

    let mut data = [0u8; 256];
    let mut spare = [0u8; 64];
    for page in 0..4u32 {
        nand.read_page_data(5, page, &mut data).unwrap();
        nand.read_page_spare(5, page, &mut spare).unwrap();
        assert_eq!(data, [page as u8; 256]);
        assert_eq!(spare, [0xF0 | page as u8; 64]);
    }
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.write_page_data(2, 7, &[0xAB; 256])?;
    nand.mark_bad(4);

    let mut image = Vec::new();
    nand.save(&mut image)?;

    let mut restored = SimNand::new(TEST_LAYOUT);
    restored.load(&mut image.as_slice())?;

    let mut buf = [0u8; 256];
    restored.read_page_data(2, 7, &mut buf)?;
    assert_eq!(buf, [0xAB; 256]);
    assert!(restored.is_bad(4));
    assert!(!restored.is_bad(2));

    Ok(())
}
