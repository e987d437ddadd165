//! The packed block-map entry: five bytes of `{pbn: 36, state: 4}`.
//!
//! Byte zero holds the mapping state in its low nibble and the top four
//! bits of the PBN in its high nibble; the remaining four bytes are the
//! low 32 bits of the PBN, little-endian.

use quarry_common::PhysicalBlockNumber;
use snafu::Snafu;

/// Entries in one 4 KiB block-map page, after the header.
pub const BLOCK_MAP_ENTRIES_PER_PAGE: usize = 812;

/// Highest encodable PBN.
pub const MAX_ENCODABLE_PBN: u64 = (1 << 36) - 1;

/// Compression slots representable in the state nibble.
pub const MAX_COMPRESSION_SLOTS: u8 = 14;

/// Error produced when an entry decodes to an impossible mapping.
#[derive(Debug, Eq, PartialEq, Snafu)]
pub enum EntryError {
    /// A compressed state with a zero PBN.
    #[snafu(display("compressed mapping with pbn 0"))]
    CompressedZero,

    /// A state nibble outside the defined range.
    #[snafu(display("undefined mapping state {}", state))]
    UndefinedState { state: u8 },

    /// A PBN too large for the 36-bit field.
    #[snafu(display("pbn {} exceeds the 36-bit field", pbn))]
    PbnTooLarge { pbn: u64 },
}

/// How a logical block maps to its physical block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockMapState {
    Unmapped,
    Uncompressed,
    /// Compressed fragment in slot `0..MAX_COMPRESSION_SLOTS`.
    Compressed(u8),
}

impl BlockMapState {
    fn nibble(self) -> u8 {
        match self {
            BlockMapState::Unmapped => 0,
            BlockMapState::Uncompressed => 1,
            BlockMapState::Compressed(slot) => 2 + slot,
        }
    }

    fn from_nibble(nibble: u8) -> Result<Self, EntryError> {
        match nibble {
            0 => Ok(BlockMapState::Unmapped),
            1 => Ok(BlockMapState::Uncompressed),
            n if n - 2 < MAX_COMPRESSION_SLOTS => Ok(BlockMapState::Compressed(n - 2)),
            n => Err(EntryError::UndefinedState { state: n }),
        }
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, BlockMapState::Compressed(_))
    }
}

/// One decoded block-map entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockMapEntry {
    pub pbn: PhysicalBlockNumber,
    pub state: BlockMapState,
}

impl BlockMapEntry {
    pub const UNMAPPED: BlockMapEntry = BlockMapEntry {
        pbn: 0,
        state: BlockMapState::Unmapped,
    };

    pub fn new(pbn: PhysicalBlockNumber, state: BlockMapState) -> Result<Self, EntryError> {
        if pbn > MAX_ENCODABLE_PBN {
            return Err(EntryError::PbnTooLarge { pbn });
        }
        if state.is_compressed() && pbn == 0 {
            return Err(EntryError::CompressedZero);
        }
        Ok(BlockMapEntry { pbn, state })
    }

    pub fn is_mapped(&self) -> bool {
        self.state != BlockMapState::Unmapped
    }

    /// Packs the entry into its five-byte on-disk form.
    pub fn pack(&self) -> [u8; 5] {
        let mut bytes = [0u8; 5];
        bytes[0] = (self.state.nibble()) | (((self.pbn >> 32) as u8 & 0x0f) << 4);
        bytes[1..5].copy_from_slice(&(self.pbn as u32).to_le_bytes());
        bytes
    }

    /// Unpacks five bytes, applying the mapping invariants: a zero PBN
    /// always means unmapped, and a compressed state requires a nonzero
    /// PBN.
    pub fn unpack(bytes: &[u8; 5]) -> Result<Self, EntryError> {
        let state = BlockMapState::from_nibble(bytes[0] & 0x0f)?;
        let pbn = (u64::from(bytes[0] >> 4) << 32)
            | u64::from(u32::from_le_bytes(bytes[1..5].try_into().expect("4 bytes")));
        if pbn == 0 {
            if state.is_compressed() {
                return Err(EntryError::CompressedZero);
            }
            return Ok(BlockMapEntry::UNMAPPED);
        }
        Ok(BlockMapEntry { pbn, state })
    }
}
