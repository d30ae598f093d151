//! An interactive harness for the NAND ring journal.
//!
//! Operates on a simulated NAND held in a raw image file, so ring behavior
//! (recovery, bad-block handling, wraparound) can be poked at from a shell
//! without real hardware.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};

use std::fs::File;
use std::path::PathBuf;

use nand_ring::nand::{Nand, NandLayout, SimNand};
use nand_ring::ring::header::PageId;
use nand_ring::ring::{scan, NandRing, RingConfig};

#[derive(Args, Debug)]
struct NandOptions {
    /// Path to the NAND image to use; omit to start from an erased device
    #[clap(long)]
    sim_path: Option<PathBuf>,

    /// Layout of the NAND to simulate, e.g. "64x64x2048+64"
    #[clap(long)]
    sim_layout: NandLayout,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<SimNand> {
        let mut sim = SimNand::new(self.sim_layout);
        if let Some(path) = &self.sim_path {
            sim.load(&mut File::open(path)?)?;
        }

        Ok(sim)
    }

    fn cleanup(&self, nand: &SimNand) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                nand.save(&mut File::create(path)?)?;
            }
        }

        Ok(())
    }
}

#[derive(Args, Debug)]
struct RingOptions {
    /// First block of the ring
    #[clap(long, default_value_t = 0)]
    start_blk: u32,

    /// Number of blocks in the ring; defaults to the rest of the device
    #[clap(long)]
    len: Option<u32>,
}

impl RingOptions {
    fn config(&self, layout: NandLayout) -> RingConfig {
        RingConfig {
            start_blk: self.start_blk,
            len: self.len.unwrap_or(layout.blocks - self.start_blk),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print each ring block's state and the id found in its first page;
    /// this is a read-only operation
    Overview,

    /// Erase every good block of the ring, discarding all records
    Format,

    /// Mount the ring and append pages filled with a repeating byte
    Append {
        /// How many pages to write
        #[clap(long, default_value_t = 1)]
        count: u32,

        /// Fill byte for the page payload
        #[clap(long, default_value_t = 0xA5)]
        fill: u8,
    },

    /// Mount the ring and report its state
    Status,
}

impl Command {
    fn execute(self, nand: SimNand, cfg: RingConfig) -> Result<SimNand> {
        match self {
            Command::Overview => {
                for b in cfg.start_blk..cfg.start_blk + cfg.len {
                    if nand.is_bad(b) {
                        println!("{b:4} => bad");
                        continue;
                    }
                    match scan::read_page_id(&nand, b, 0) {
                        PageId::Wasted => println!("{b:4} => empty"),
                        PageId::Valid(id) => println!("{b:4} => id {id}"),
                    }
                }

                Ok(nand)
            }

            Command::Format => {
                let mut nand = nand;
                let mut erased = 0u32;
                for b in cfg.start_blk..cfg.start_blk + cfg.len {
                    if nand.is_bad(b) {
                        continue;
                    }
                    if nand.erase(b).is_err() {
                        nand.mark_bad(b);
                        continue;
                    }
                    erased += 1;
                }
                println!("erased {erased} blocks");

                Ok(nand)
            }

            Command::Append { count, fill } => {
                let layout = nand.get_layout();
                let mut ring = NandRing::start(nand, cfg);
                ring.mount()?;

                let data = vec![fill; layout.page_data_size];
                let first_id = ring.cur_id();
                for _ in 0..count {
                    ring.write_page(&data)?;
                }
                println!(
                    "wrote ids {}..{} ending at block {} page {}",
                    first_id,
                    ring.cur_id() - 1,
                    ring.cur_blk(),
                    ring.cur_page(),
                );

                ring.umount();
                Ok(ring.stop())
            }

            Command::Status => {
                let mut ring = NandRing::start(nand, cfg);
                ring.mount()?;
                println!(
                    "good blocks: {} / {}; next id {} at block {} page {}",
                    ring.total_good(),
                    cfg.len,
                    ring.cur_id(),
                    ring.cur_blk(),
                    ring.cur_page(),
                );

                ring.umount();
                Ok(ring.stop())
            }
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    /// Where the ring lives on it
    #[clap(flatten)]
    ring: RingOptions,

    /// The command to run against this ring
    #[clap(subcommand)]
    cmd: Command,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = args.nand.open()?;
    let cfg = args.ring.config(nand.get_layout());
    let nand = args.cmd.execute(nand, cfg)?;
    args.nand.cleanup(&nand)?;
    Ok(())
}
