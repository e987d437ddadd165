//! The open chapter: the in-memory batch of records currently accepting
//! inserts.
//!
//! Records accumulate unordered until the chapter is full; closing it
//! sorts them by name, chunks them into record pages, and hands the
//! result to the volume writer. The open chapter exclusively owns its
//! records until then.

use std::collections::HashMap;

use bytes::{Buf, BufMut};

use crate::geometry::Geometry;
use crate::name::{RecordMetadata, RecordName};

/// A record slot left empty in a partial closing chapter. Sorts after
/// every real name and is never routed to by a chapter index entry.
const PAD_NAME: [u8; 16] = [0xff; 16];

/// The in-memory chapter currently accepting inserts.
pub struct OpenChapter {
    capacity: usize,
    records: Vec<(RecordName, RecordMetadata)>,
    by_name: HashMap<RecordName, usize>,
}

impl OpenChapter {
    pub fn new(geometry: &Geometry) -> Self {
        let capacity = geometry.records_per_chapter() as usize;
        OpenChapter {
            capacity,
            records: Vec::with_capacity(capacity),
            by_name: HashMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.capacity
    }

    /// Looks up a record by name.
    pub fn get(&self, name: &RecordName) -> Option<&RecordMetadata> {
        self.by_name.get(name).map(|&i| &self.records[i].1)
    }

    /// Inserts a record, overwriting the metadata if the name is already
    /// present. Returns `true` if the name was new.
    pub fn put(&mut self, name: RecordName, metadata: RecordMetadata) -> bool {
        match self.by_name.get(&name) {
            Some(&i) => {
                self.records[i].1 = metadata;
                false
            }
            None => {
                debug_assert!(!self.is_full());
                self.by_name.insert(name, self.records.len());
                self.records.push((name, metadata));
                true
            }
        }
    }

    /// Empties the chapter for reuse under the next virtual chapter
    /// number.
    pub fn reset(&mut self) {
        self.records.clear();
        self.by_name.clear();
    }

    /// Closes the chapter: sorts the records and packs them into record
    /// pages. The open chapter itself is left untouched; the caller
    /// resets it once the closed form is safely written.
    pub fn close(&self, geometry: &Geometry) -> ClosedChapter {
        let mut sorted = self.records.clone();
        sorted.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let per_page = geometry.records_per_page as usize;
        let page_count = geometry.record_pages_per_chapter as usize;
        let mut pages = Vec::with_capacity(page_count);
        let mut page_of = Vec::with_capacity(sorted.len());
        for page_index in 0..page_count {
            let mut page = Vec::with_capacity(geometry.bytes_per_page);
            for slot in 0..per_page {
                match sorted.get(page_index * per_page + slot) {
                    Some((name, metadata)) => {
                        page.extend_from_slice(&name.0);
                        page.extend_from_slice(metadata);
                        page_of.push(page_index as u32);
                    }
                    None => {
                        page.extend_from_slice(&PAD_NAME);
                        page.extend_from_slice(&[0u8; 16]);
                    }
                }
            }
            debug_assert_eq!(page.len(), geometry.bytes_per_page);
            pages.push(page);
        }

        ClosedChapter {
            records: sorted,
            page_of,
            pages,
        }
    }

    /// Serializes the raw records for the save image.
    pub fn save_to(&self, out: &mut Vec<u8>) {
        out.put_u32_le(u32::try_from(self.records.len()).expect("record count fits u32"));
        for (name, metadata) in &self.records {
            out.extend_from_slice(&name.0);
            out.extend_from_slice(metadata);
        }
    }

    /// Restores records from a save image, replacing current contents.
    pub fn load_from(&mut self, mut input: &[u8]) -> Option<usize> {
        if input.remaining() < 4 {
            return None;
        }
        let count = input.get_u32_le() as usize;
        if input.remaining() < count * 32 {
            return None;
        }
        self.reset();
        for _ in 0..count {
            let mut name = [0u8; 16];
            let mut metadata = [0u8; 16];
            input.copy_to_slice(&mut name);
            input.copy_to_slice(&mut metadata);
            self.put(RecordName(name), metadata);
        }
        Some(count)
    }
}

/// A chapter after closing: sorted records, their page assignment, and
/// the serialized record pages.
pub struct ClosedChapter {
    /// Records sorted by name.
    pub records: Vec<(RecordName, RecordMetadata)>,
    /// Record page number for each sorted record, in order.
    pub page_of: Vec<u32>,
    /// Serialized record pages, exactly `record_pages_per_chapter` of
    /// them.
    pub pages: Vec<Vec<u8>>,
}

/// Binary-searches a serialized record page for a name.
pub fn search_record_page(page: &[u8], name: &RecordName) -> Option<RecordMetadata> {
    let count = page.len() / 32;
    let mut lo = 0usize;
    let mut hi = count;
    while lo < hi {
        let mid = (lo + hi) / 2;
        let offset = mid * 32;
        let candidate = &page[offset..offset + 16];
        match candidate.cmp(&name.0[..]) {
            std::cmp::Ordering::Less => lo = mid + 1,
            std::cmp::Ordering::Greater => hi = mid,
            std::cmp::Ordering::Equal => {
                let mut metadata = [0u8; 16];
                metadata.copy_from_slice(&page[offset + 16..offset + 32]);
                return Some(metadata);
            }
        }
    }
    None
}
