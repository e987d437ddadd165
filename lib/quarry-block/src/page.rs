//! The self-describing block-map page.
//!
//! A page carries `{version, nonce, pbn, initialized}` ahead of its
//! entries; loading validates the header against the expected
//! `(nonce, pbn)` pair and reformats the page empty on any mismatch, so
//! a torn write or a block leaked from another volume can never be
//! interpreted as mappings.

use bytes::{Buf, BufMut};
use quarry_common::BLOCK_SIZE;

use crate::entry::{BlockMapEntry, BLOCK_MAP_ENTRIES_PER_PAGE};

/// Bytes in one block-map page on disk.
pub const BLOCK_MAP_PAGE_BYTES: usize = BLOCK_SIZE;

/// Header ahead of the packed entries.
const PAGE_HEADER_BYTES: usize = 32;

const PAGE_VERSION: u32 = 4;

/// Result of interpreting a page read from storage.
pub enum PageValidity {
    /// The header matched; the decoded page follows.
    Valid(BlockMapPage),
    /// The header did not match expectations; the caller starts from a
    /// freshly formatted page.
    Invalid,
}

/// One decoded block-map page.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockMapPage {
    pub nonce: u64,
    /// The physical block this page lives at; self-describing.
    pub pbn: u64,
    pub initialized: bool,
    pub entries: Vec<BlockMapEntry>,
}

impl BlockMapPage {
    /// A freshly formatted page: all entries unmapped.
    pub fn format(nonce: u64, pbn: u64) -> Self {
        BlockMapPage {
            nonce,
            pbn,
            initialized: false,
            entries: vec![BlockMapEntry::UNMAPPED; BLOCK_MAP_ENTRIES_PER_PAGE],
        }
    }

    /// Serializes the page into its on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert_eq!(self.entries.len(), BLOCK_MAP_ENTRIES_PER_PAGE);
        let mut buf = Vec::with_capacity(BLOCK_MAP_PAGE_BYTES);
        buf.put_u32_le(PAGE_VERSION);
        buf.put_u32_le(0); // reserved
        buf.put_u64_le(self.nonce);
        buf.put_u64_le(self.pbn);
        buf.put_u8(u8::from(self.initialized));
        buf.resize(PAGE_HEADER_BYTES, 0);
        for entry in &self.entries {
            buf.extend_from_slice(&entry.pack());
        }
        buf.resize(BLOCK_MAP_PAGE_BYTES, 0);
        buf
    }

    /// Decodes a page read from `expected_pbn`, validating the header.
    /// Any mismatch, including undecodable entries, reformats.
    pub fn decode(bytes: &[u8], expected_nonce: u64, expected_pbn: u64) -> PageValidity {
        if bytes.len() != BLOCK_MAP_PAGE_BYTES {
            return PageValidity::Invalid;
        }
        let mut input = bytes;
        let version = input.get_u32_le();
        let _reserved = input.get_u32_le();
        let nonce = input.get_u64_le();
        let pbn = input.get_u64_le();
        let initialized = input.get_u8() != 0;
        if version != PAGE_VERSION || nonce != expected_nonce || pbn != expected_pbn || !initialized
        {
            return PageValidity::Invalid;
        }
        let mut entries = Vec::with_capacity(BLOCK_MAP_ENTRIES_PER_PAGE);
        let packed = &bytes[PAGE_HEADER_BYTES..];
        for i in 0..BLOCK_MAP_ENTRIES_PER_PAGE {
            let slice: &[u8; 5] = packed[i * 5..i * 5 + 5].try_into().expect("5 bytes");
            match BlockMapEntry::unpack(slice) {
                Ok(entry) => entries.push(entry),
                Err(_) => return PageValidity::Invalid,
            }
        }
        PageValidity::Valid(BlockMapPage {
            nonce,
            pbn,
            initialized,
            entries,
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::entry::BlockMapState;

    #[test]
    fn encode_decode_round_trip() {
        let mut page = BlockMapPage::format(0x1122_3344_5566_7788, 42);
        page.initialized = true;
        page.entries[0] = BlockMapEntry::new(77, BlockMapState::Uncompressed).unwrap();
        page.entries[811] = BlockMapEntry::new(99, BlockMapState::Compressed(5)).unwrap();

        let encoded = page.encode();
        assert_eq!(encoded.len(), BLOCK_MAP_PAGE_BYTES);
        match BlockMapPage::decode(&encoded, page.nonce, 42) {
            PageValidity::Valid(decoded) => assert_eq!(decoded, page),
            PageValidity::Invalid => panic!("page must validate"),
        }
    }

    #[test]
    fn wrong_nonce_or_pbn_reformats() {
        let mut page = BlockMapPage::format(1, 10);
        page.initialized = true;
        let encoded = page.encode();
        assert!(matches!(
            BlockMapPage::decode(&encoded, 2, 10),
            PageValidity::Invalid
        ));
        assert!(matches!(
            BlockMapPage::decode(&encoded, 1, 11),
            PageValidity::Invalid
        ));
        assert!(matches!(
            BlockMapPage::decode(&encoded, 1, 10),
            PageValidity::Valid(_)
        ));
    }

    #[test]
    fn uninitialized_and_zeroed_pages_reformat() {
        let page = BlockMapPage::format(1, 10);
        // Never marked initialized.
        assert!(matches!(
            BlockMapPage::decode(&page.encode(), 1, 10),
            PageValidity::Invalid
        ));
        assert!(matches!(
            BlockMapPage::decode(&[0u8; BLOCK_MAP_PAGE_BYTES], 0, 0),
            PageValidity::Invalid
        ));
    }
}
