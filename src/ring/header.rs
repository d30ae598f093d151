//! The per-page header kept in the spare area, with CRC verification and
//! computation.
//!
//! The serialized form is packed little-endian and must stay bit-exact: rings
//! written by earlier firmware have to keep mounting after an upgrade.
//!
//! | offset | size | field          |
//! |--------|------|----------------|
//! | 0      | 4    | page_ecc       |
//! | 4      | 2    | bad_mark       |
//! | 6      | 2    | padding        |
//! | 8      | 8    | id             |
//! | 16     | 4    | utc_correction |
//! | 20     | 4    | padding        |
//! | 24     | 8    | time_boot_us   |
//! | 32     | 4    | spare_crc      |

use crc::{Crc, CRC_32_JAMCRC};
use deku::prelude::*;

/// CRC-32 used over the header, seeded with `0xFFFFFFFF`
pub const RING_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_JAMCRC);

/// Serialized size of [`PageHeader`]; must fit the device's spare area
pub const HEADER_SIZE: usize = 36;

/// Byte offset of `bad_mark` within the serialized header (2 bytes wide)
pub const BAD_MARK_OFFSET: usize = 4;

/// `bad_mark` value of a page in a healthy block
pub const BAD_MARK_GOOD: u16 = 0xFFFF;

/// Reserved id meaning "no valid record here"; also what a CRC failure maps to
pub const PAGE_ID_WASTED: u64 = 0;

/// Lowest id that may appear on a sealed page
pub const PAGE_ID_FIRST: u64 = 1;

/// The identifier read back from a page.
///
/// `Wasted` covers both "never programmed" (erased spare cannot carry a valid
/// CRC) and "programmed but unreadable"; the reserved on-flash encoding is
/// confined to [`PageId::to_raw`]/[`PageId::from_raw`]. The derived ordering
/// ranks `Wasted` below every valid id, which is exactly how the recovery
/// scan compares pages.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub enum PageId {
    Wasted,
    Valid(u64),
}

impl PageId {
    pub fn from_raw(raw: u64) -> Self {
        match raw {
            PAGE_ID_WASTED => Self::Wasted,
            id => Self::Valid(id),
        }
    }

    pub fn to_raw(self) -> u64 {
        match self {
            Self::Wasted => PAGE_ID_WASTED,
            Self::Valid(id) => id,
        }
    }

    /// The id of a sealed page, or None for a wasted one
    pub fn valid(self) -> Option<u64> {
        match self {
            Self::Wasted => None,
            Self::Valid(id) => Some(id),
        }
    }
}

/// The header sealed into a page's spare area
#[derive(Debug, Clone, Copy, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct PageHeader {
    /// Device-computed ECC over the page data; opaque to the journal
    pub page_ecc: u32,

    /// `0xFFFF` in every page the journal seals; anything else is reserved
    /// for driver-level bad-block marking conventions
    pub bad_mark: u16,
    pub padding1: u16,

    /// Strictly monotonically increasing across the ring's lifetime
    pub id: u64,

    /// Host-supplied UTC offset, copied verbatim from the ring
    pub utc_correction: u32,
    pub padding2: u32,

    /// Monotonic boot microseconds at seal time
    pub time_boot_us: u64,

    /// CRC over all preceding header bytes
    pub spare_crc: u32,
}

impl PageHeader {
    /// Build the header for a page about to be sealed, CRC included
    pub fn seal(page_ecc: u32, id: u64, utc_correction: u32, time_boot_us: u64) -> Self {
        let mut header = Self {
            page_ecc,
            bad_mark: BAD_MARK_GOOD,
            padding1: 0,
            id,
            utc_correction,
            padding2: 0,
            time_boot_us,
            spare_crc: 0,
        };
        header.fix_crc();
        header
    }

    pub fn compute_crc(&self) -> u32 {
        let header_bytes = self.to_bytes().unwrap();
        let header_len = header_bytes.len() - std::mem::size_of::<u32>();
        RING_CRC.checksum(&header_bytes[..header_len])
    }

    pub fn check_crc(&self) -> bool {
        self.spare_crc == self.compute_crc()
    }

    pub fn fix_crc(&mut self) {
        self.spare_crc = self.compute_crc();
    }

    /// Parse a header from the leading bytes of a spare buffer, with CRC
    /// verification. An erased spare (all `0xFF`) fails the CRC and comes
    /// back `None`, the same as a torn or corrupt one.
    pub fn decode(spare: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((spare, 0)).ok()?;

        if !header.check_crc() {
            return None;
        }

        Some(header)
    }

    /// Serialized form, [`HEADER_SIZE`] bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.to_bytes().unwrap()
    }

    pub fn page_id(&self) -> PageId {
        PageId::from_raw(self.id)
    }
}
