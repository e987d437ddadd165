//! The volume: the on-disk chapter ring and everything that fronts it.
//!
//! The volume is a flat array of pages on a [`BlockDevice`]: reserved
//! header pages, then `chapters_per_volume` physical chapters, each laid
//! out as its index pages followed by its record pages. A fixed page
//! cache with an asynchronous read queue fronts all request-path reads;
//! reader tasks perform the I/O and restart parked requests.

pub mod cache;
pub mod device;
pub mod sparse_cache;

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;
use snafu::{ResultExt, Snafu};
use tokio::task::JoinHandle;

use crate::chapter_index::{ChapterIndexError, ChapterIndexPage};
use crate::geometry::Geometry;
use crate::name::{RecordMetadata, RecordName};
use crate::open_chapter::search_record_page;

use self::cache::PageCache;
use self::device::BlockDevice;

/// Minimum spacing between chapter-write flushes. Chapters written
/// inside the window reach disk on the next flush or save; a crash in
/// between is repaired by replay.
const CHAPTER_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Error produced by volume operations.
#[derive(Debug, Snafu)]
pub enum VolumeError {
    /// An I/O error from the backing device.
    #[snafu(display("volume I/O error: {}", source))]
    Io { source: io::Error },

    /// A chapter index page failed validation.
    #[snafu(display("bad chapter index page: {}", source))]
    Page { source: ChapterIndexError },
}

/// Outcome of a cache-fronted chapter search.
pub enum CachedSearch {
    Found(RecordMetadata),
    NotFound,
    /// The search needs this page; the caller parks the request on the
    /// read queue and retries when restarted.
    NeedsPage(u64),
}

struct IndexPageMapEntry {
    vcn: u64,
    first_lists: Vec<u32>,
}

/// The chapter ring plus its page cache and reader tasks.
pub struct Volume {
    geometry: Geometry,
    device: Arc<dyn BlockDevice>,
    cache: Arc<PageCache>,
    /// First page of the chapter ring on the device.
    base_page: u64,
    /// Per-slot map of which index page covers which delta lists.
    index_page_map: Mutex<HashMap<u32, IndexPageMapEntry>>,
    reader_tasks: Mutex<Vec<JoinHandle<()>>>,
    last_flush: AtomicCell<Instant>,
}

impl Volume {
    /// Creates the volume and spawns its reader tasks.
    pub fn new(
        geometry: &Geometry,
        device: Arc<dyn BlockDevice>,
        base_page: u64,
        zone_count: u32,
        cache_slots: usize,
        reader_count: usize,
    ) -> Arc<Self> {
        let cache = PageCache::new(cache_slots.max(1), zone_count as usize);
        let volume = Arc::new(Volume {
            geometry: geometry.clone(),
            device,
            cache,
            base_page,
            index_page_map: Mutex::new(HashMap::new()),
            reader_tasks: Mutex::new(Vec::new()),
            last_flush: AtomicCell::new(Instant::now()),
        });
        let mut tasks = volume.reader_tasks.lock();
        for _ in 0..reader_count.max(1) {
            let cache = Arc::clone(&volume.cache);
            let device = Arc::clone(&volume.device);
            let page_size = volume.geometry.bytes_per_page;
            tasks.push(tokio::spawn(async move {
                reader_loop(cache, device, page_size).await;
            }));
        }
        drop(tasks);
        volume
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Stops the reader tasks and waits for them to park.
    pub async fn shutdown(&self) {
        self.cache.begin_shutdown();
        let tasks: Vec<_> = self.reader_tasks.lock().drain(..).collect();
        futures::future::join_all(tasks).await;
    }

    /// Whether enough time has passed that the next chapter write
    /// should carry a flush. Exactly one of any concurrent callers wins
    /// the claim.
    fn should_flush(&self) -> bool {
        let last_flush = self.last_flush.load();
        last_flush.elapsed() > CHAPTER_FLUSH_INTERVAL
            && self.last_flush.compare_exchange(last_flush, Instant::now()).is_ok()
    }

    /// Forces everything written so far to durable storage.
    pub async fn sync(&self) -> Result<(), VolumeError> {
        self.last_flush.store(Instant::now());
        self.device.flush().await.context(IoSnafu)
    }

    /// The device page holding `page` of the chapter in `slot`.
    pub fn map_to_physical_page(&self, slot: u32, page: u32) -> u64 {
        self.base_page
            + u64::from(slot) * u64::from(self.geometry.pages_per_chapter())
            + u64::from(page)
    }

    /// Writes one closed chapter: index pages, then record pages, then a
    /// flush. The slot's previous tenant is invalidated from the cache
    /// first, so no stale page survives the overwrite.
    pub async fn write_chapter(
        &self,
        vcn: u64,
        index_pages: &[Vec<u8>],
        record_pages: &[Vec<u8>],
    ) -> Result<(), VolumeError> {
        let slot = self.geometry.physical_chapter(vcn);
        debug_assert_eq!(index_pages.len(), self.geometry.index_pages_per_chapter as usize);
        debug_assert_eq!(record_pages.len(), self.geometry.record_pages_per_chapter as usize);

        for page in 0..self.geometry.pages_per_chapter() {
            self.cache.invalidate_page(self.map_to_physical_page(slot, page)).await;
        }

        let mut first_lists = Vec::with_capacity(index_pages.len());
        for (i, data) in index_pages.iter().enumerate() {
            first_lists.push(packed_page_lowest_list(data));
            self.device
                .write_page(self.map_to_physical_page(slot, i as u32), data)
                .await
                .context(IoSnafu)?;
        }
        for (i, data) in record_pages.iter().enumerate() {
            let page = self.geometry.index_pages_per_chapter + i as u32;
            self.device
                .write_page(self.map_to_physical_page(slot, page), data)
                .await
                .context(IoSnafu)?;
        }
        if self.should_flush() {
            self.device.flush().await.context(IoSnafu)?;
        }

        self.index_page_map
            .lock()
            .insert(slot, IndexPageMapEntry { vcn, first_lists });
        debug!(vcn, slot, "wrote chapter");
        Ok(())
    }

    /// Drops a chapter that has aged out: cached pages and the index
    /// page map entry for its slot.
    pub async fn forget_chapter(&self, vcn: u64) {
        let slot = self.geometry.physical_chapter(vcn);
        let stale = {
            let map = self.index_page_map.lock();
            map.get(&slot).is_some_and(|e| e.vcn == vcn)
        };
        if stale {
            self.index_page_map.lock().remove(&slot);
        }
        for page in 0..self.geometry.pages_per_chapter() {
            self.cache.invalidate_page(self.map_to_physical_page(slot, page)).await;
        }
    }

    /// Searches a closed chapter through the page cache.
    ///
    /// On a cache miss the needed page number is handed back instead of
    /// blocking, so the zone worker can park the request and move on.
    pub async fn search_cached(
        &self,
        vcn: u64,
        name: &RecordName,
        zone: u32,
    ) -> Result<CachedSearch, VolumeError> {
        let slot = self.geometry.physical_chapter(vcn);
        let Some(first_lists) = self.index_page_bounds(vcn).await? else {
            return Ok(CachedSearch::NotFound);
        };
        let list = name.chapter_delta_list(&self.geometry);
        let index_page = first_lists.partition_point(|&first| first <= list) - 1;
        let index_pbn = self.map_to_physical_page(slot, index_page as u32);

        let Some(page) = self.cache.probe_protected(index_pbn, zone) else {
            return Ok(CachedSearch::NeedsPage(index_pbn));
        };
        let parsed = ChapterIndexPage::parse(&page.data, &self.geometry).context(PageSnafu)?;
        if parsed.vcn != vcn {
            return Ok(CachedSearch::NotFound);
        }
        let Some(record_page) = parsed.search(name, &self.geometry) else {
            return Ok(CachedSearch::NotFound);
        };

        let record_pbn =
            self.map_to_physical_page(slot, self.geometry.index_pages_per_chapter + record_page);
        let Some(page) = self.cache.probe_protected(record_pbn, zone) else {
            return Ok(CachedSearch::NeedsPage(record_pbn));
        };
        Ok(match search_record_page(&page.data, name) {
            Some(metadata) => CachedSearch::Found(metadata),
            None => CachedSearch::NotFound,
        })
    }

    /// Searches a closed chapter with direct reads, bypassing the cache.
    /// Used by rebuild and the sparse fill path.
    pub async fn search_direct(
        &self,
        vcn: u64,
        name: &RecordName,
    ) -> Result<Option<RecordMetadata>, VolumeError> {
        let Some(pages) = self.read_chapter_index(vcn).await? else {
            return Ok(None);
        };
        let list = name.chapter_delta_list(&self.geometry);
        let Some(page) = pages.iter().find(|p| p.covers(list)) else {
            return Ok(None);
        };
        let Some(record_page) = page.search(name, &self.geometry) else {
            return Ok(None);
        };
        let data = self.read_record_page(vcn, record_page).await?;
        Ok(search_record_page(&data, name))
    }

    /// Reads and parses a whole chapter index directly. Returns `None`
    /// when the slot does not currently hold that chapter.
    pub async fn read_chapter_index(
        &self,
        vcn: u64,
    ) -> Result<Option<Vec<ChapterIndexPage>>, VolumeError> {
        let slot = self.geometry.physical_chapter(vcn);
        let mut pages = Vec::with_capacity(self.geometry.index_pages_per_chapter as usize);
        for i in 0..self.geometry.index_pages_per_chapter {
            let data = self.read_page_direct(self.map_to_physical_page(slot, i)).await?;
            let page = match ChapterIndexPage::parse(&data, &self.geometry) {
                Ok(page) => page,
                Err(ChapterIndexError::ChecksumMismatch { .. })
                | Err(ChapterIndexError::InvalidPage { .. }) => return Ok(None),
                Err(e) => return Err(VolumeError::Page { source: e }),
            };
            if page.vcn != vcn {
                return Ok(None);
            }
            pages.push(page);
        }
        Ok(Some(pages))
    }

    /// Reads one record page of a chapter directly.
    pub async fn read_record_page(&self, vcn: u64, record_page: u32) -> Result<Vec<u8>, VolumeError> {
        let slot = self.geometry.physical_chapter(vcn);
        self.read_page_direct(
            self.map_to_physical_page(slot, self.geometry.index_pages_per_chapter + record_page),
        )
        .await
    }

    /// The virtual chapter currently stored in a physical slot, if the
    /// slot holds a valid chapter.
    pub async fn chapter_in_slot(&self, slot: u32) -> Result<Option<u64>, VolumeError> {
        let data = self.read_page_direct(self.map_to_physical_page(slot, 0)).await?;
        match ChapterIndexPage::parse(&data, &self.geometry) {
            Ok(page) if self.geometry.physical_chapter(page.vcn) == slot => Ok(Some(page.vcn)),
            Ok(_) | Err(_) => Ok(None),
        }
    }

    async fn read_page_direct(&self, pbn: u64) -> Result<Vec<u8>, VolumeError> {
        let mut buf = vec![0u8; self.geometry.bytes_per_page];
        self.device.read_page(pbn, &mut buf).await.context(IoSnafu)?;
        Ok(buf)
    }

    /// The first-list bounds of a chapter's index pages, rebuilding the
    /// map entry from disk when the slot changed hands.
    async fn index_page_bounds(&self, vcn: u64) -> Result<Option<Vec<u32>>, VolumeError> {
        let slot = self.geometry.physical_chapter(vcn);
        {
            let map = self.index_page_map.lock();
            if let Some(entry) = map.get(&slot) {
                if entry.vcn == vcn {
                    return Ok(Some(entry.first_lists.clone()));
                }
                return Ok(None);
            }
        }
        let Some(pages) = self.read_chapter_index(vcn).await? else {
            return Ok(None);
        };
        let first_lists: Vec<u32> = pages.iter().map(|p| p.lowest_list).collect();
        self.index_page_map.lock().insert(
            slot,
            IndexPageMapEntry {
                vcn,
                first_lists: first_lists.clone(),
            },
        );
        Ok(Some(first_lists))
    }
}

/// Lowest-list field of a packed chapter index page header.
fn packed_page_lowest_list(page: &[u8]) -> u32 {
    u32::from_be_bytes(page[12..16].try_into().expect("4 bytes"))
}

/// Reader task: waits for queued reads, performs the I/O, installs the
/// page, and restarts the parked requests.
async fn reader_loop(cache: Arc<PageCache>, device: Arc<dyn BlockDevice>, page_size: usize) {
    loop {
        if cache.is_shut_down() {
            return;
        }
        let Some(pbn) = cache.pop_pending_read() else {
            cache.reader_parked().await;
            continue;
        };
        let mut buf = vec![0u8; page_size];
        match device.read_page(pbn, &mut buf).await {
            Ok(()) => {
                for waiter in cache.install_page(pbn, buf) {
                    waiter(true);
                }
            }
            Err(e) => {
                warn!(pbn, error = %e, "volume page read failed");
                for waiter in cache.abandon_read(pbn) {
                    waiter(false);
                }
            }
        }
    }
}
