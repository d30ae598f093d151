//! A circular append-only journal over raw NAND flash.
//!
//! The ring spans a contiguous range of physical blocks and appends fixed-size
//! records, one per page, sealing each page with a header in the spare area.
//! Bad blocks, program/erase failures and sudden power loss are normal
//! operating conditions: a mount scans the ring, repairs a possibly-torn tail
//! and resumes appending after the newest durable page.

pub mod nand;
pub mod ring;
pub mod util;
