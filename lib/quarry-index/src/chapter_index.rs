//! Chapter indexes: the per-chapter structure mapping a record name to
//! the record page holding it.
//!
//! While a chapter is open its index lives in memory as a delta index
//! over `delta_lists_per_chapter` lists. Closing the chapter packs those
//! lists into `index_pages_per_chapter` on-disk pages; each page covers a
//! contiguous run of lists and is self-describing, so a reader can
//! reconstruct any list from the page alone.
//!
//! The on-disk format is intentionally lossy at insert time: a put that
//! would overflow the page budget drops the record, and lookups fall back
//! to "not found in this chapter".

use bytes::{Buf, BufMut};
use snafu::Snafu;

use crate::delta_index::{DeltaIndex, DeltaIndexError};
use crate::geometry::Geometry;
use crate::name::RecordName;

/// Identifies a packed chapter index page on disk. Chapter headers are
/// big-endian.
const CHAPTER_INDEX_PAGE_MAGIC: u32 = 0x5143_4950;

/// Fixed page header: magic, virtual chapter number, lowest list, list
/// count.
const PAGE_HEADER_BYTES: usize = 4 + 8 + 4 + 2;

/// Trailing checksum.
const PAGE_CHECKSUM_BYTES: usize = 4;

/// Error produced by chapter index operations.
#[derive(Debug, Snafu)]
pub enum ChapterIndexError {
    /// The packed lists cannot fit the chapter's page budget.
    #[snafu(display("chapter index does not fit {} pages ({} lists left over)", pages, leftover))]
    PackOverflow { pages: u32, leftover: u32 },

    /// A page failed structural validation.
    #[snafu(display("invalid chapter index page: {}", reason))]
    InvalidPage { reason: String },

    /// A page failed checksum validation.
    #[snafu(display("chapter index page checksum mismatch: {:08x} vs {:08x}", calculated, stored))]
    ChecksumMismatch { calculated: u32, stored: u32 },

    /// The underlying delta index rejected an operation.
    #[snafu(display("chapter index delta error: {}", source))]
    Delta { source: DeltaIndexError },
}

/// Mean key gap of a chapter delta list, from the address span and the
/// expected records per list.
fn chapter_mean_delta(geometry: &Geometry) -> u32 {
    let per_list = geometry.records_per_chapter() / geometry.delta_lists_per_chapter;
    let span = 1u64 << geometry.chapter_address_bits;
    u32::try_from(span / u64::from(per_list.max(1))).expect("mean delta fits u32")
}

/// Bits one packed page can devote to list contents.
fn page_usable_bits(geometry: &Geometry) -> u64 {
    ((geometry.bytes_per_page - PAGE_HEADER_BYTES - PAGE_CHECKSUM_BYTES - 2) * 8) as u64
}

/// The in-memory index of the open chapter.
pub struct OpenChapterIndex {
    pub vcn: u64,
    delta: DeltaIndex,
    geometry: Geometry,
}

impl OpenChapterIndex {
    pub fn new(geometry: &Geometry, vcn: u64) -> Self {
        let delta = DeltaIndex::empty(
            geometry.delta_lists_per_chapter,
            chapter_mean_delta(geometry),
            geometry.chapter_payload_bits.max(1),
            u64::from(geometry.records_per_chapter()),
        )
        .with_list_cap(page_usable_bits(geometry));
        OpenChapterIndex {
            vcn,
            delta,
            geometry: geometry.clone(),
        }
    }

    /// Indexes one record. `Overflow` means the on-disk format cannot
    /// represent this density; the caller drops the record.
    pub fn put(&mut self, name: &RecordName, record_page: u32) -> Result<(), DeltaIndexError> {
        let list = name.chapter_delta_list(&self.geometry);
        let address = name.chapter_address(&self.geometry);
        let cursor = self.delta.seek(list, address)?;
        if !cursor.at_end && cursor.key == address {
            self.delta
                .put(&cursor, address, u64::from(record_page), Some(&name.0))
        } else {
            self.delta.put(&cursor, address, u64::from(record_page), None)
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.delta.get_stats().record_count
    }

    pub fn overflow_count(&self) -> u64 {
        self.delta.get_stats().overflow_count
    }

    /// Packs the index into `index_pages_per_chapter` self-describing
    /// pages. Lists are assigned to pages in order, balanced so that
    /// trailing pages are not left empty, and
    /// `sum(lists per page) = delta_lists_per_chapter`.
    pub fn pack(&self) -> Result<Vec<Vec<u8>>, ChapterIndexError> {
        let page_count = self.geometry.index_pages_per_chapter;
        let total_lists = self.geometry.delta_lists_per_chapter;
        let capacity = self.geometry.bytes_per_page;

        let mut pages = Vec::with_capacity(page_count as usize);
        let mut next_list = 0u32;
        for page_no in 0..page_count {
            let remaining_pages = page_count - page_no;
            let remaining_lists = total_lists - next_list;
            let target = remaining_lists.div_ceil(remaining_pages);

            let mut taken = 0u32;
            let mut list_bytes = 0usize;
            while taken < target {
                let size = self.delta.list_size_bits(next_list + taken);
                let with_next = PAGE_HEADER_BYTES
                    + PAGE_CHECKSUM_BYTES
                    + 2 * (taken as usize + 1)
                    + list_bytes
                    + usize::try_from(size.div_ceil(8)).expect("size fits usize");
                if with_next > capacity {
                    break;
                }
                list_bytes += usize::try_from(size.div_ceil(8)).expect("size fits usize");
                taken += 1;
            }
            if taken == 0 && remaining_lists > 0 {
                return Err(ChapterIndexError::PackOverflow {
                    pages: page_count,
                    leftover: remaining_lists,
                });
            }

            let mut buf = Vec::with_capacity(capacity);
            buf.put_u32(CHAPTER_INDEX_PAGE_MAGIC);
            buf.put_u64(self.vcn);
            buf.put_u32(next_list);
            buf.put_u16(u16::try_from(taken).expect("list count fits u16"));
            for i in 0..taken {
                let size = self.delta.list_size_bits(next_list + i);
                buf.put_u16(u16::try_from(size).expect("list size fits u16"));
            }
            for i in 0..taken {
                self.delta.export_list(next_list + i, &mut buf);
            }
            buf.resize(capacity - PAGE_CHECKSUM_BYTES, 0);
            let checksum = crc32fast::hash(&buf);
            buf.put_u32(checksum);
            debug_assert_eq!(buf.len(), capacity);

            pages.push(buf);
            next_list += taken;
        }

        if next_list < total_lists {
            return Err(ChapterIndexError::PackOverflow {
                pages: page_count,
                leftover: total_lists - next_list,
            });
        }
        Ok(pages)
    }
}

/// A packed chapter index page, reconstructed for searching.
pub struct ChapterIndexPage {
    pub vcn: u64,
    pub lowest_list: u32,
    pub list_count: u32,
    delta: DeltaIndex,
}

impl ChapterIndexPage {
    /// Parses a page read back from the volume, validating its checksum
    /// and structure.
    pub fn parse(bytes: &[u8], geometry: &Geometry) -> Result<Self, ChapterIndexError> {
        if bytes.len() != geometry.bytes_per_page {
            return Err(ChapterIndexError::InvalidPage {
                reason: format!("page is {} bytes, expected {}", bytes.len(), geometry.bytes_per_page),
            });
        }
        let body = &bytes[..bytes.len() - PAGE_CHECKSUM_BYTES];
        let stored = (&bytes[bytes.len() - PAGE_CHECKSUM_BYTES..]).get_u32();
        let calculated = crc32fast::hash(body);
        if calculated != stored {
            return Err(ChapterIndexError::ChecksumMismatch { calculated, stored });
        }

        let mut input = body;
        let magic = input.get_u32();
        if magic != CHAPTER_INDEX_PAGE_MAGIC {
            return Err(ChapterIndexError::InvalidPage {
                reason: format!("bad magic {magic:08x}"),
            });
        }
        let vcn = input.get_u64();
        let lowest_list = input.get_u32();
        let list_count = u32::from(input.get_u16());
        if lowest_list + list_count > geometry.delta_lists_per_chapter {
            return Err(ChapterIndexError::InvalidPage {
                reason: format!("lists {lowest_list}+{list_count} exceed chapter"),
            });
        }
        if input.remaining() < list_count as usize * 2 {
            return Err(ChapterIndexError::InvalidPage {
                reason: "truncated list table".to_string(),
            });
        }
        let sizes: Vec<u64> = (0..list_count).map(|_| u64::from(input.get_u16())).collect();

        let mut delta = DeltaIndex::empty(
            list_count.max(1),
            chapter_mean_delta(geometry),
            geometry.chapter_payload_bits.max(1),
            u64::from(geometry.records_per_chapter()),
        );
        for (i, &size) in sizes.iter().enumerate() {
            let byte_len = usize::try_from(size.div_ceil(8)).expect("size fits usize");
            if input.remaining() < byte_len {
                return Err(ChapterIndexError::InvalidPage {
                    reason: "truncated list bits".to_string(),
                });
            }
            delta
                .import_list(i as u32, size, &input[..byte_len])
                .map_err(|source| ChapterIndexError::Delta { source })?;
            input.advance(byte_len);
        }

        Ok(ChapterIndexPage {
            vcn,
            lowest_list,
            list_count,
            delta,
        })
    }

    /// Whether this page covers the given chapter delta list.
    pub fn covers(&self, list: u32) -> bool {
        list >= self.lowest_list && list < self.lowest_list + self.list_count
    }

    /// Searches for a name, returning the record page number to probe.
    ///
    /// A collision entry must match the full name; a plain entry is a
    /// candidate whose record page verifies the name exactly, so a false
    /// positive here costs one page probe and nothing else.
    pub fn search(&self, name: &RecordName, geometry: &Geometry) -> Option<u32> {
        let list = name.chapter_delta_list(geometry);
        if !self.covers(list) {
            return None;
        }
        let local = list - self.lowest_list;
        let address = name.chapter_address(geometry);
        let mut cursor = self.delta.seek(local, address).ok()?;
        if cursor.at_end || cursor.key != address {
            return None;
        }
        let mut candidate = None;
        loop {
            if cursor.is_collision {
                if self.delta.collision_name(&cursor).as_ref() == Some(&name.0) {
                    return Some(self.delta.payload(&cursor) as u32);
                }
            } else {
                candidate = Some(self.delta.payload(&cursor) as u32);
            }
            if !self.delta.next_entry(&mut cursor) || cursor.key != address {
                break;
            }
        }
        candidate
    }

    /// Entry count on this page; used by rebuild progress reporting.
    pub fn entry_count(&self) -> u64 {
        self.delta.get_stats().record_count
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::geometry::tests_support::tiny_geometry;

    fn name_of(i: u32) -> RecordName {
        RecordName::from_content(&i.to_le_bytes())
    }

    #[test]
    fn put_then_search_through_packed_pages() {
        let geometry = tiny_geometry();
        let mut index = OpenChapterIndex::new(&geometry, 7);
        let total = geometry.records_per_chapter();
        let mut dropped = 0;
        for i in 0..total {
            match index.put(&name_of(i), i % geometry.record_pages_per_chapter) {
                Ok(()) => {}
                Err(DeltaIndexError::Overflow { .. }) => dropped += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(dropped, 0, "tiny geometry should not overflow");

        let pages = index.pack().unwrap();
        assert_eq!(pages.len(), geometry.index_pages_per_chapter as usize);
        let parsed: Vec<ChapterIndexPage> = pages
            .iter()
            .map(|p| ChapterIndexPage::parse(p, &geometry).unwrap())
            .collect();

        let covered: u32 = parsed.iter().map(|p| p.list_count).sum();
        assert_eq!(covered, geometry.delta_lists_per_chapter);

        for i in 0..total {
            let name = name_of(i);
            let list = name.chapter_delta_list(&geometry);
            let page = parsed.iter().find(|p| p.covers(list)).unwrap();
            assert_eq!(page.vcn, 7);
            assert_eq!(
                page.search(&name, &geometry),
                Some(i % geometry.record_pages_per_chapter),
                "record {i}"
            );
        }
    }

    #[test]
    fn empty_chapter_packs_consistently() {
        let geometry = tiny_geometry();
        let index = OpenChapterIndex::new(&geometry, 0);
        let pages = index.pack().unwrap();
        assert_eq!(pages.len(), geometry.index_pages_per_chapter as usize);

        let mut expected_lowest = 0;
        let mut total = 0;
        for bytes in &pages {
            let page = ChapterIndexPage::parse(bytes, &geometry).unwrap();
            assert_eq!(page.lowest_list, expected_lowest);
            expected_lowest += page.list_count;
            total += page.list_count;
            assert_eq!(page.entry_count(), 0);
        }
        assert_eq!(total, geometry.delta_lists_per_chapter);
    }

    #[test]
    fn corrupt_page_is_rejected() {
        let geometry = tiny_geometry();
        let mut index = OpenChapterIndex::new(&geometry, 3);
        index.put(&name_of(1), 0).unwrap();
        let mut pages = index.pack().unwrap();
        pages[0][40] ^= 0x10;
        assert!(matches!(
            ChapterIndexPage::parse(&pages[0], &geometry),
            Err(ChapterIndexError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn colliding_addresses_disambiguate_by_name() {
        let geometry = tiny_geometry();
        let mut index = OpenChapterIndex::new(&geometry, 1);
        // Two names forced onto the same list and address.
        let a = RecordName([0u8; 16]);
        let mut b_bytes = [0u8; 16];
        b_bytes[0] = 1; // differs outside the chapter index field
        let b = RecordName(b_bytes);
        assert_eq!(a.chapter_delta_list(&geometry), b.chapter_delta_list(&geometry));
        assert_eq!(a.chapter_address(&geometry), b.chapter_address(&geometry));

        index.put(&a, 0).unwrap();
        index.put(&b, 3).unwrap();
        let pages = index.pack().unwrap();
        let list = a.chapter_delta_list(&geometry);
        let page = pages
            .iter()
            .map(|p| ChapterIndexPage::parse(p, &geometry).unwrap())
            .find(|p| p.covers(list))
            .unwrap();
        // The collision entry answers exactly; the base entry remains a
        // candidate for its own name.
        assert_eq!(page.search(&b, &geometry), Some(3));
        assert_eq!(page.search(&a, &geometry), Some(0));
    }
}
