//! The sparse cache: parsed chapter indexes of the most recently
//! referenced sparse chapters.
//!
//! In a sparse configuration only hooks reach the volume index; when a
//! hook leads a request to a sparse chapter, that chapter's index pages
//! are cached here so the non-hook names that travelled with it can
//! still be answered without a volume-index entry.

use parking_lot::Mutex;

use crate::chapter_index::ChapterIndexPage;
use crate::geometry::Geometry;
use crate::name::RecordName;

/// Chapters retained by default; a handful is enough to cover the
/// working set of a deduplicating stream.
pub const DEFAULT_SPARSE_CACHE_CAPACITY: usize = 8;

struct CachedChapter {
    vcn: u64,
    pages: Vec<ChapterIndexPage>,
}

/// MRU cache of parsed sparse chapter indexes.
pub struct SparseCache {
    capacity: usize,
    chapters: Mutex<Vec<CachedChapter>>,
}

impl SparseCache {
    pub fn new(capacity: usize) -> Self {
        SparseCache {
            capacity: capacity.max(1),
            chapters: Mutex::new(Vec::new()),
        }
    }

    /// Whether the chapter is cached; touching it moves it to the front.
    pub fn touch(&self, vcn: u64) -> bool {
        let mut chapters = self.chapters.lock();
        if let Some(pos) = chapters.iter().position(|c| c.vcn == vcn) {
            let chapter = chapters.remove(pos);
            chapters.insert(0, chapter);
            true
        } else {
            false
        }
    }

    /// Inserts a chapter at the front, evicting the least recently
    /// referenced one past capacity.
    pub fn insert(&self, vcn: u64, pages: Vec<ChapterIndexPage>) {
        let mut chapters = self.chapters.lock();
        if let Some(pos) = chapters.iter().position(|c| c.vcn == vcn) {
            chapters.remove(pos);
        }
        chapters.insert(0, CachedChapter { vcn, pages });
        while chapters.len() > self.capacity {
            let evicted = chapters.pop().expect("non-empty");
            trace!(vcn = evicted.vcn, "evicted sparse chapter");
        }
    }

    /// Searches cached chapters in MRU order for a name, returning the
    /// chapter and record page to probe.
    pub fn search(&self, name: &RecordName, geometry: &Geometry) -> Option<(u64, u32)> {
        let chapters = self.chapters.lock();
        for chapter in chapters.iter() {
            for page in &chapter.pages {
                if page.covers(name.chapter_delta_list(geometry)) {
                    if let Some(record_page) = page.search(name, geometry) {
                        return Some((chapter.vcn, record_page));
                    }
                    break;
                }
            }
        }
        None
    }

    /// Drops chapters that have aged out of the ring.
    pub fn invalidate_before(&self, oldest_live_vcn: u64) {
        self.chapters.lock().retain(|c| c.vcn >= oldest_live_vcn);
    }

    pub fn cached_chapters(&self) -> Vec<u64> {
        self.chapters.lock().iter().map(|c| c.vcn).collect()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::chapter_index::OpenChapterIndex;
    use crate::geometry::tests_support::tiny_sparse_geometry;

    fn pages_for(geometry: &Geometry, vcn: u64, names: &[RecordName]) -> Vec<ChapterIndexPage> {
        let mut index = OpenChapterIndex::new(geometry, vcn);
        for (i, name) in names.iter().enumerate() {
            index.put(name, i as u32 % geometry.record_pages_per_chapter).unwrap();
        }
        index
            .pack()
            .unwrap()
            .iter()
            .map(|p| ChapterIndexPage::parse(p, geometry).unwrap())
            .collect()
    }

    #[test]
    fn mru_order_and_eviction() {
        let geometry = tiny_sparse_geometry();
        let cache = SparseCache::new(2);
        cache.insert(1, pages_for(&geometry, 1, &[]));
        cache.insert(2, pages_for(&geometry, 2, &[]));
        assert!(cache.touch(1));
        cache.insert(3, pages_for(&geometry, 3, &[]));
        assert_eq!(cache.cached_chapters(), vec![3, 1]);
        assert!(!cache.touch(2));
    }

    #[test]
    fn search_finds_names_in_cached_chapters() {
        let geometry = tiny_sparse_geometry();
        let names: Vec<RecordName> = (0..20u32)
            .map(|i| RecordName::from_content(&i.to_le_bytes()))
            .collect();
        let cache = SparseCache::new(4);
        cache.insert(5, pages_for(&geometry, 5, &names));

        let (vcn, _page) = cache.search(&names[3], &geometry).expect("cached");
        assert_eq!(vcn, 5);
        let absent = RecordName::from_content(b"absent");
        assert_eq!(cache.search(&absent, &geometry), None);
    }

    #[test]
    fn aged_chapters_are_dropped() {
        let geometry = tiny_sparse_geometry();
        let cache = SparseCache::new(4);
        cache.insert(3, pages_for(&geometry, 3, &[]));
        cache.insert(9, pages_for(&geometry, 9, &[]));
        cache.invalidate_before(5);
        assert_eq!(cache.cached_chapters(), vec![9]);
    }
}
