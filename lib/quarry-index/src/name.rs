//! Record names and the fields packed inside them.
//!
//! A record name is 16 bytes of 128-bit non-cryptographic hash output.
//! The bytes are partitioned into three disjoint ranges, each consumed by
//! a different structure:
//!
//! ```text
//!   bytes  0..8   VOLUME_INDEX_BYTES   zone + volume-index list + key
//!   bytes  8..14  CHAPTER_INDEX_BYTES  chapter delta list + address
//!   bytes 14..16  SAMPLE_BYTES         sparse hook selector
//! ```
//!
//! Multi-byte fields are read big-endian, so a name prints and sorts the
//! same on every host.

use std::fmt;

use xxhash_rust::xxh3::xxh3_128_with_seed;

use crate::geometry::Geometry;

/// Fixed seed for content hashing; baked into the on-disk format.
const RECORD_NAME_SEED: u64 = 0x5ca1_ab1e_0ddb_a11;

const VOLUME_INDEX_BYTES: std::ops::Range<usize> = 0..8;
const CHAPTER_INDEX_BYTES: std::ops::Range<usize> = 8..14;
const SAMPLE_BYTES: std::ops::Range<usize> = 14..16;

/// Opaque 16-byte metadata stored alongside a name.
pub type RecordMetadata = [u8; 16];

/// A 16-byte record name.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RecordName(pub [u8; 16]);

impl RecordName {
    /// Hashes a block of content into its record name.
    pub fn from_content(data: &[u8]) -> Self {
        RecordName(xxh3_128_with_seed(data, RECORD_NAME_SEED).to_be_bytes())
    }

    /// The volume-index field: bytes 0..8, big-endian.
    pub fn volume_index_field(&self) -> u64 {
        u64::from_be_bytes(self.0[VOLUME_INDEX_BYTES].try_into().expect("8 bytes"))
    }

    /// The chapter-index field: bytes 8..14, big-endian.
    pub fn chapter_index_field(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[2..8].copy_from_slice(&self.0[CHAPTER_INDEX_BYTES]);
        u64::from_be_bytes(buf)
    }

    /// The sample field: bytes 14..16, big-endian.
    pub fn sample_field(&self) -> u16 {
        u16::from_be_bytes(self.0[SAMPLE_BYTES].try_into().expect("2 bytes"))
    }

    /// The volume-index delta list this name hashes to, across all zones.
    pub fn volume_index_list(&self, geometry: &Geometry) -> u32 {
        u32::try_from(self.volume_index_field() % u64::from(geometry.volume_index_delta_lists))
            .expect("list number fits in u32")
    }

    /// The volume-index key within its delta list.
    pub fn volume_index_address(&self, geometry: &Geometry) -> u64 {
        let spread = self.volume_index_field() / u64::from(geometry.volume_index_delta_lists);
        spread & mask(geometry.volume_index_address_bits)
    }

    /// The chapter-index delta list within a chapter.
    pub fn chapter_delta_list(&self, geometry: &Geometry) -> u32 {
        u32::try_from(self.chapter_index_field() % u64::from(geometry.delta_lists_per_chapter))
            .expect("list number fits in u32")
    }

    /// The chapter-index key within its delta list.
    pub fn chapter_address(&self, geometry: &Geometry) -> u64 {
        let spread = self.chapter_index_field() / u64::from(geometry.delta_lists_per_chapter);
        spread & mask(geometry.chapter_address_bits)
    }

    /// Whether this name is sampled into the volume index of a sparse
    /// configuration. Every name is a hook in a dense configuration.
    pub fn is_hook(&self, geometry: &Geometry) -> bool {
        u32::from(self.sample_field()) % geometry.sparse_sample_rate == 0
    }
}

pub(crate) fn mask(bits: u32) -> u64 {
    debug_assert!(bits <= 63);
    (1u64 << bits) - 1
}

impl fmt::Debug for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
