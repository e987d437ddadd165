//! Index geometry: every capacity and addressing constant, derived once
//! from the configured memory size.
//!
//! The memory size is a named capacity tier, not a byte-accurate budget.
//! Each tier fixes the record-page count per chapter and the chapter
//! count; everything else (delta-list counts, address widths, index-page
//! counts) follows arithmetically and is computed here so the rest of the
//! crate never re-derives a constant.

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// Bytes in one on-disk page.
pub const BYTES_PER_PAGE: usize = 4096;

/// Bytes per stored record: a 16-byte name plus 16 bytes of metadata.
pub const BYTES_PER_RECORD: usize = 32;

/// Records held by one record page.
pub const RECORDS_PER_PAGE: u32 = (BYTES_PER_PAGE / BYTES_PER_RECORD) as u32;

/// Pages reserved at the front of the volume for the geometry block and
/// volume header.
pub const HEADER_PAGES_PER_VOLUME: u32 = 1;

/// Chapters in every full-size volume tier.
pub const DEFAULT_CHAPTERS_PER_VOLUME: u32 = 1024;

/// Mean key gap targeted by the volume index delta lists.
pub const VOLUME_INDEX_MEAN_DELTA: u32 = 4096;

/// Mean key gap targeted by the chapter index delta lists.
pub const CHAPTER_INDEX_MEAN_DELTA: u32 = 4096;

/// Records assigned to one chapter-index delta list, on average.
pub const RECORDS_PER_CHAPTER_INDEX_LIST: u32 = 64;

/// One name in this many is a hook in a sparse configuration.
pub const DEFAULT_SPARSE_SAMPLE_RATE: u32 = 32;

/// Error produced when a geometry cannot be derived.
#[derive(Debug, Snafu)]
pub enum GeometryError {
    /// The requested gigabyte tier is outside the supported range.
    #[snafu(display("unsupported memory size: {} GiB (supported: 1..={})", requested, MAX_GIGABYTES))]
    UnsupportedMemorySize { requested: u32 },
}

/// Largest supported gigabyte tier.
pub const MAX_GIGABYTES: u32 = 16;

/// Named capacity tier for the index.
///
/// The sub-gigabyte tiers shrink the chapter (fewer record pages); the
/// gigabyte tiers grow the volume (more chapters). `reduced` siblings
/// subtract one chapter, which keeps the converted volume the same size
/// after an LVM headroom move.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySize {
    Mb256,
    Mb512,
    Mb768,
    Gb(u32),
}

impl MemorySize {
    fn record_pages_per_chapter(self) -> u32 {
        match self {
            MemorySize::Mb256 => 64,
            MemorySize::Mb512 => 128,
            MemorySize::Mb768 => 192,
            MemorySize::Gb(_) => 256,
        }
    }

    fn chapters_per_volume(self) -> Result<u32, GeometryError> {
        match self {
            MemorySize::Mb256 | MemorySize::Mb512 | MemorySize::Mb768 => {
                Ok(DEFAULT_CHAPTERS_PER_VOLUME)
            }
            MemorySize::Gb(n) if (1..=MAX_GIGABYTES).contains(&n) => {
                Ok(DEFAULT_CHAPTERS_PER_VOLUME * n)
            }
            MemorySize::Gb(n) => Err(GeometryError::UnsupportedMemorySize { requested: n }),
        }
    }
}

/// The complete derived geometry of one index volume.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    /// Bytes in one page; fixed, but carried so on-disk readers never
    /// assume it.
    pub bytes_per_page: usize,
    /// Records in one record page.
    pub records_per_page: u32,
    /// Record pages in one chapter.
    pub record_pages_per_chapter: u32,
    /// Index pages in one chapter.
    pub index_pages_per_chapter: u32,
    /// Chapters in the volume ring.
    pub chapters_per_volume: u32,
    /// Delta lists in one chapter index.
    pub delta_lists_per_chapter: u32,
    /// Bits in a chapter-index key (the "chapter address").
    pub chapter_address_bits: u32,
    /// Bits in a chapter-index payload (a record page number).
    pub chapter_payload_bits: u32,
    /// Delta lists in the volume index, across all zones.
    pub volume_index_delta_lists: u32,
    /// Bits in a volume-index key.
    pub volume_index_address_bits: u32,
    /// Bits in a volume-index payload (a windowed chapter number).
    pub volume_index_payload_bits: u32,
    /// Chapters tracked only sparsely; zero for a dense index.
    pub sparse_chapters_per_volume: u32,
    /// One name in this many is a hook; one for a dense index.
    pub sparse_sample_rate: u32,
}

impl Geometry {
    /// Derives the geometry for a memory tier.
    ///
    /// `reduced` subtracts one chapter from the volume, producing the
    /// sibling geometry used after an LVM conversion. `sparse` enables
    /// hook sampling and marks most of the volume sparse.
    pub fn derive(size: MemorySize, reduced: bool, sparse: bool) -> Result<Self, GeometryError> {
        let record_pages_per_chapter = size.record_pages_per_chapter();
        let full_chapters = size.chapters_per_volume()?;
        let chapters_per_volume = if reduced { full_chapters - 1 } else { full_chapters };

        let records_per_chapter = RECORDS_PER_PAGE * record_pages_per_chapter;
        let delta_lists_per_chapter = records_per_chapter / RECORDS_PER_CHAPTER_INDEX_LIST;

        // Key span per chapter list is sized so the average gap between
        // sorted keys is the mean delta the codec is tuned for.
        let chapter_address_bits =
            log2_ceil(u64::from(RECORDS_PER_CHAPTER_INDEX_LIST) * u64::from(CHAPTER_INDEX_MEAN_DELTA));
        let chapter_payload_bits = log2_ceil(u64::from(record_pages_per_chapter));

        // Volume index sizing always uses the full chapter count, so the
        // reduced sibling shares the exact delta list shape and a save
        // image survives an LVM conversion.
        let full_records = u64::from(records_per_chapter) * u64::from(full_chapters);
        let volume_index_delta_lists =
            u32::try_from((full_records / u64::from(VOLUME_INDEX_MEAN_DELTA)).max(256))
                .expect("delta list count fits in u32");
        let records_per_volume_list = full_records / u64::from(volume_index_delta_lists);
        let volume_index_address_bits =
            log2_ceil(records_per_volume_list * u64::from(VOLUME_INDEX_MEAN_DELTA));

        // The payload is a chapter number reduced to a window two volumes
        // wide, so a stale entry can never alias a live chapter.
        let volume_index_payload_bits = log2_ceil(u64::from(full_chapters)) + 1;

        let (sparse_chapters_per_volume, sparse_sample_rate) = if sparse {
            // All but a tenth of the ring is sparse; the dense tail keeps
            // recent chapters fully searchable without hook sampling.
            (
                chapters_per_volume - chapters_per_volume / 10,
                DEFAULT_SPARSE_SAMPLE_RATE,
            )
        } else {
            (0, 1)
        };

        let index_pages_per_chapter = index_pages_for(
            records_per_chapter,
            chapter_address_bits,
            chapter_payload_bits,
        );

        Ok(Geometry {
            bytes_per_page: BYTES_PER_PAGE,
            records_per_page: RECORDS_PER_PAGE,
            record_pages_per_chapter,
            index_pages_per_chapter,
            chapters_per_volume,
            delta_lists_per_chapter,
            chapter_address_bits,
            chapter_payload_bits,
            volume_index_delta_lists,
            volume_index_address_bits,
            volume_index_payload_bits,
            sparse_chapters_per_volume,
            sparse_sample_rate,
        })
    }

    /// Records collected before the open chapter closes.
    pub fn records_per_chapter(&self) -> u32 {
        self.records_per_page * self.record_pages_per_chapter
    }

    /// Total pages in one physical chapter.
    pub fn pages_per_chapter(&self) -> u32 {
        self.index_pages_per_chapter + self.record_pages_per_chapter
    }

    /// Total pages in the volume, headers included.
    pub fn pages_per_volume(&self) -> u64 {
        u64::from(HEADER_PAGES_PER_VOLUME)
            + u64::from(self.pages_per_chapter()) * u64::from(self.chapters_per_volume)
    }

    /// Records retrievable from the whole ring.
    pub fn records_per_volume(&self) -> u64 {
        u64::from(self.records_per_chapter()) * u64::from(self.chapters_per_volume)
    }

    /// Whether this geometry samples hooks.
    pub fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }

    /// Number of dense (always volume-indexed) chapters.
    pub fn dense_chapters_per_volume(&self) -> u32 {
        self.chapters_per_volume - self.sparse_chapters_per_volume
    }

    /// The physical chapter slot for a virtual chapter number.
    pub fn physical_chapter(&self, vcn: u64) -> u32 {
        u32::try_from(vcn % u64::from(self.chapters_per_volume)).expect("slot fits in u32")
    }

    /// Whether `vcn` has aged out of the ring relative to the newest
    /// virtual chapter number.
    pub fn has_aged_out(&self, vcn: u64, newest: u64) -> bool {
        newest >= u64::from(self.chapters_per_volume)
            && vcn <= newest - u64::from(self.chapters_per_volume)
    }
}

/// Index pages needed to hold a packed chapter index.
///
/// Sized from the expected per-entry bit cost (mean delta code plus
/// payload plus list bookkeeping), with one page of slack so an unlucky
/// key distribution packs without overflowing into record drops.
fn index_pages_for(records_per_chapter: u32, address_bits: u32, payload_bits: u32) -> u32 {
    let mean_delta_bits = u64::from(address_bits.saturating_sub(
        log2_ceil(u64::from(RECORDS_PER_CHAPTER_INDEX_LIST)),
    )) + 2;
    let bits_per_entry = mean_delta_bits + u64::from(payload_bits) + 2;
    let total_bits = u64::from(records_per_chapter) * bits_per_entry;
    let bits_per_page = (BYTES_PER_PAGE as u64) * 8;
    u32::try_from(total_bits.div_ceil(bits_per_page) + 1).expect("page count fits in u32")
}

/// Smallest `b` with `2^b >= value`; zero maps to zero.
pub(crate) fn log2_ceil(value: u64) -> u32 {
    match value {
        0 | 1 => 0,
        v => 64 - (v - 1).leading_zeros(),
    }
}
