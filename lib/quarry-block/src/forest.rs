//! The block-map forest: one tree of block-map pages per root, four
//! interior levels above the leaves.
//!
//! Pages live in an arena keyed by `(root, height, page_index)`; the
//! tree structure is implicit in the path arithmetic, so there are no
//! parent pointers and no cycles. Loading a page from storage is
//! single-flight per path: the first walker becomes the loader, later
//! walkers park on the path's waiter list and resume when the page is
//! installed. A page whose header does not match the expected
//! `(nonce, pbn)` is reformatted empty rather than trusted.
//!
//! Mutations are journaled before they dirty a page; the page's
//! `recovery_lock` pins the oldest journal sequence the page depends
//! on, released only when a write covering it acknowledges.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_common::{LogicalBlockNumber, PhysicalBlockNumber, SequenceNumber};
use snafu::Snafu;
use tokio::sync::oneshot;

use crate::entry::{BlockMapEntry, BlockMapState, BLOCK_MAP_ENTRIES_PER_PAGE};
use crate::era::DirtyLists;
use crate::journal::{JournalEntry, JournalEntryKind, RecoveryJournal};
use crate::page::{BlockMapPage, PageValidity, BLOCK_MAP_PAGE_BYTES};
use crate::read_only::ReadOnlyNotifier;
use crate::slab::{PhysicalAllocator, SlabError};
use crate::store::PageStore;

/// Leaf plus four interior levels.
pub const BLOCK_MAP_TREE_HEIGHT: usize = 5;

/// Error produced by forest operations.
#[derive(Debug, Snafu)]
pub enum ForestError {
    /// An interior entry decoded to something that cannot address a
    /// tree page.
    #[snafu(display("bad mapping at height {}: {}", height, reason))]
    BadMapping { height: u32, reason: String },

    /// Metadata I/O failed; the layer goes read-only.
    #[snafu(display("metadata I/O error: {}", source))]
    Io { source: io::Error },

    /// The slab depot could not serve the request.
    #[snafu(display("allocator error: {}", source))]
    Slab { source: SlabError },

    /// The layer is read-only.
    #[snafu(display("block layer is read-only"))]
    ReadOnly,
}

/// Arena key of one tree page.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct PagePath {
    pub root: u32,
    pub height: u32,
    pub page_index: u64,
}

/// The slot path of one logical block through its tree.
#[derive(Clone, Copy, Debug)]
pub struct TreeSlots {
    pub root: u32,
    /// `page_index[h]` of the page visited at height `h`.
    pub page_index: [u64; BLOCK_MAP_TREE_HEIGHT],
    /// Slot within the height-`h` page selecting the height `h-1`
    /// child; `slot[0]` is the leaf entry slot.
    pub slot: [usize; BLOCK_MAP_TREE_HEIGHT],
}

/// Decomposes a logical block number into its tree path.
pub fn decompose(lbn: LogicalBlockNumber, root_count: u32) -> TreeSlots {
    let entries = BLOCK_MAP_ENTRIES_PER_PAGE as u64;
    let leaf_index = lbn / entries;
    let root = u32::try_from(leaf_index % u64::from(root_count)).expect("root fits u32");

    let mut page_index = [0u64; BLOCK_MAP_TREE_HEIGHT];
    let mut slot = [0usize; BLOCK_MAP_TREE_HEIGHT];
    page_index[0] = leaf_index;
    slot[0] = usize::try_from(lbn % entries).expect("slot fits usize");
    for height in 1..BLOCK_MAP_TREE_HEIGHT {
        page_index[height] = page_index[height - 1] / entries;
        slot[height] = usize::try_from(page_index[height - 1] % entries).expect("slot fits usize");
    }
    TreeSlots {
        root,
        page_index,
        slot,
    }
}

struct TreePage {
    pbn: PhysicalBlockNumber,
    entries: Vec<BlockMapEntry>,
    /// Oldest journal sequence with a pending modification; zero when
    /// none.
    recovery_lock: SequenceNumber,
    /// Captured at write start.
    writing_recovery_lock: SequenceNumber,
}

struct ForestState {
    pages: HashMap<PagePath, TreePage>,
    dirty: DirtyLists<PagePath>,
}

/// The forest configuration.
#[derive(Clone, Copy, Debug)]
pub struct ForestConfig {
    pub nonce: u64,
    pub root_count: u32,
    /// First PBN of the preallocated root pages; root `i` lives at
    /// `root_origin + i`.
    pub root_origin: PhysicalBlockNumber,
    /// Exclusive upper bound for valid tree-page PBNs.
    pub physical_blocks: u64,
    /// Journal sequences per writeback era.
    pub era_period: u64,
}

/// The block-map forest.
pub struct Forest {
    config: ForestConfig,
    store: Arc<dyn PageStore>,
    journal: Arc<dyn RecoveryJournal>,
    allocator: Arc<dyn PhysicalAllocator>,
    read_only: Arc<ReadOnlyNotifier>,
    state: Mutex<ForestState>,
    loading: Mutex<HashMap<PagePath, Vec<oneshot::Sender<()>>>>,
}

impl Forest {
    pub fn new(
        config: ForestConfig,
        store: Arc<dyn PageStore>,
        journal: Arc<dyn RecoveryJournal>,
        allocator: Arc<dyn PhysicalAllocator>,
        read_only: Arc<ReadOnlyNotifier>,
    ) -> Self {
        assert!(config.root_count > 0);
        let mut pages = HashMap::new();
        for root in 0..config.root_count {
            // Root pages are preallocated by the format step; they
            // start formatted and are loaded lazily if present on disk.
            let path = PagePath {
                root,
                height: (BLOCK_MAP_TREE_HEIGHT - 1) as u32,
                page_index: 0,
            };
            pages.insert(
                path,
                TreePage {
                    pbn: config.root_origin + u64::from(root),
                    entries: vec![BlockMapEntry::UNMAPPED; BLOCK_MAP_ENTRIES_PER_PAGE],
                    recovery_lock: 0,
                    writing_recovery_lock: 0,
                },
            );
        }
        Forest {
            config,
            store,
            journal,
            allocator,
            read_only,
            state: Mutex::new(ForestState {
                pages,
                dirty: DirtyLists::new(config.era_period),
            }),
            loading: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the root pages from storage, reformatting any that do not
    /// validate. Called once before serving traffic on an existing
    /// volume.
    pub async fn load_roots(&self) -> Result<(), ForestError> {
        for root in 0..self.config.root_count {
            let path = PagePath {
                root,
                height: (BLOCK_MAP_TREE_HEIGHT - 1) as u32,
                page_index: 0,
            };
            let pbn = self.config.root_origin + u64::from(root);
            let page = self.read_tree_page(pbn).await?;
            let mut state = self.state.lock();
            let slot = state.pages.get_mut(&path).expect("root preallocated");
            slot.entries = page.entries;
        }
        Ok(())
    }

    /// Looks up the mapping for a logical block. Never allocates; an
    /// unmapped interior entry short-circuits to `UNMAPPED`.
    pub async fn lookup(&self, lbn: LogicalBlockNumber) -> Result<BlockMapEntry, ForestError> {
        match self.walk(lbn, false).await? {
            None => Ok(BlockMapEntry::UNMAPPED),
            Some(leaf) => {
                let slots = decompose(lbn, self.config.root_count);
                let state = self.state.lock();
                let page = state.pages.get(&leaf).expect("leaf resident after walk");
                Ok(page.entries[slots.slot[0]])
            }
        }
    }

    /// Replaces the mapping for a logical block, allocating interior
    /// pages along the way, and returns the previous entry.
    pub async fn update(
        &self,
        lbn: LogicalBlockNumber,
        new_entry: BlockMapEntry,
    ) -> Result<BlockMapEntry, ForestError> {
        if self.read_only.is_read_only() {
            return Err(ForestError::ReadOnly);
        }
        let leaf = self
            .walk(lbn, true)
            .await?
            .expect("allocating walk reaches the leaf");
        let slots = decompose(lbn, self.config.root_count);
        let mut state = self.state.lock();
        let page = state.pages.get_mut(&leaf).expect("leaf resident after walk");
        let old = page.entries[slots.slot[0]];
        // An unmap journals the block it releases, so replay can honor
        // the decrement against the mapping it finds.
        let sequence = self.journal.append(JournalEntry {
            kind: JournalEntryKind::DataMapping,
            lbn,
            pbn: if new_entry.is_mapped() { new_entry.pbn } else { old.pbn },
            increment: new_entry.is_mapped(),
        });
        let page = state.pages.get_mut(&leaf).expect("leaf resident after walk");
        page.entries[slots.slot[0]] = new_entry;
        if page.recovery_lock == 0 {
            page.recovery_lock = sequence;
            self.journal.acquire_lock(sequence);
        }
        state.dirty.mark_dirty(leaf, sequence);
        Ok(old)
    }

    /// The PBN of the leaf page covering `lbn`, or `None` when that
    /// leaf was never allocated.
    pub async fn find_block_map_page_pbn(
        &self,
        lbn: LogicalBlockNumber,
    ) -> Result<Option<PhysicalBlockNumber>, ForestError> {
        match self.walk(lbn, false).await? {
            None => Ok(None),
            Some(leaf) => {
                let state = self.state.lock();
                Ok(state.pages.get(&leaf).map(|p| p.pbn))
            }
        }
    }

    /// Walks from the root toward the leaf. With `allocate`, missing
    /// interior pages are allocated and journaled; without it, an
    /// unmapped entry ends the walk with `None`.
    async fn walk(
        &self,
        lbn: LogicalBlockNumber,
        allocate: bool,
    ) -> Result<Option<PagePath>, ForestError> {
        let slots = decompose(lbn, self.config.root_count);
        if slots.page_index[BLOCK_MAP_TREE_HEIGHT - 1] != 0 {
            // Beyond the address span of one root page per tree.
            return Err(ForestError::BadMapping {
                height: (BLOCK_MAP_TREE_HEIGHT - 1) as u32,
                reason: format!("lbn {lbn} outside the tree address span"),
            });
        }
        let mut current = PagePath {
            root: slots.root,
            height: (BLOCK_MAP_TREE_HEIGHT - 1) as u32,
            page_index: slots.page_index[BLOCK_MAP_TREE_HEIGHT - 1],
        };
        for height in (1..BLOCK_MAP_TREE_HEIGHT).rev() {
            let slot = slots.slot[height];
            let child = PagePath {
                root: slots.root,
                height: height as u32 - 1,
                page_index: slots.page_index[height - 1],
            };
            let entry = {
                let state = self.state.lock();
                let page = state.pages.get(&current).expect("walk keeps pages resident");
                page.entries[slot]
            };
            match entry.state {
                BlockMapState::Unmapped => {
                    if !allocate {
                        return Ok(None);
                    }
                    // Installs the child page alongside the parent slot.
                    self.allocate_child(current, slot, child).await?;
                }
                BlockMapState::Uncompressed => {
                    if entry.pbn >= self.config.physical_blocks {
                        return Err(ForestError::BadMapping {
                            height: height as u32,
                            reason: format!("pbn {} out of range", entry.pbn),
                        });
                    }
                    self.ensure_loaded(child, entry.pbn).await?;
                }
                BlockMapState::Compressed(_) => {
                    return Err(ForestError::BadMapping {
                        height: height as u32,
                        reason: "compressed state in an interior entry".to_string(),
                    });
                }
            }
            current = child;
        }
        Ok(Some(current))
    }

    /// Allocates a child tree page: new block from the depot, a journal
    /// entry, the parent slot updated and dirtied, and the child
    /// installed formatted.
    async fn allocate_child(
        &self,
        parent: PagePath,
        slot: usize,
        child: PagePath,
    ) -> Result<(), ForestError> {
        let pbn = self.allocator.allocate().map_err(|source| {
            if source == SlabError::NoSpace {
                ForestError::Slab { source }
            } else {
                self.read_only.enter_read_only(source.to_string());
                ForestError::ReadOnly
            }
        })?;
        let sequence = self.journal.append(JournalEntry {
            kind: JournalEntryKind::TreePage,
            lbn: 0,
            pbn,
            increment: true,
        });

        let mut state = self.state.lock();
        let parent_page = state.pages.get_mut(&parent).expect("parent resident");
        // A racing walker may have allocated this child while we were
        // in the depot; honor the winner and release our block.
        if parent_page.entries[slot].is_mapped() {
            drop(state);
            let _ = self.allocator.adjust_reference(pbn, false);
            return Ok(());
        }
        let entry = BlockMapEntry::new(pbn, BlockMapState::Uncompressed).map_err(|e| {
            ForestError::BadMapping {
                height: parent.height,
                reason: e.to_string(),
            }
        })?;
        parent_page.entries[slot] = entry;
        if parent_page.recovery_lock == 0 {
            parent_page.recovery_lock = sequence;
            self.journal.acquire_lock(sequence);
        }
        state.dirty.mark_dirty(parent, sequence);

        state.pages.insert(
            child,
            TreePage {
                pbn,
                entries: vec![BlockMapEntry::UNMAPPED; BLOCK_MAP_ENTRIES_PER_PAGE],
                recovery_lock: sequence,
                writing_recovery_lock: 0,
            },
        );
        self.journal.acquire_lock(sequence);
        state.dirty.mark_dirty(child, sequence);
        trace!(
            root = child.root,
            height = child.height,
            page_index = child.page_index,
            pbn,
            "allocated tree page"
        );
        Ok(())
    }

    /// Single-flight load of a tree page. The first caller reads and
    /// validates; everyone else parks on the path's waiter list.
    async fn ensure_loaded(&self, path: PagePath, pbn: PhysicalBlockNumber) -> Result<(), ForestError> {
        loop {
            if self.state.lock().pages.contains_key(&path) {
                return Ok(());
            }
            let waiter = {
                let mut loading = self.loading.lock();
                if self.state.lock().pages.contains_key(&path) {
                    return Ok(());
                }
                match loading.get_mut(&path) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        loading.insert(path, Vec::new());
                        None
                    }
                }
            };
            match waiter {
                Some(rx) => {
                    // The loader wakes us; the page may still have
                    // failed, so loop and re-check.
                    let _ = rx.await;
                }
                None => {
                    let result = self.read_tree_page(pbn).await;
                    let waiters = self.loading.lock().remove(&path).unwrap_or_default();
                    match result {
                        Ok(page) => {
                            let mut state = self.state.lock();
                            state.pages.entry(path).or_insert(TreePage {
                                pbn,
                                entries: page.entries,
                                recovery_lock: 0,
                                writing_recovery_lock: 0,
                            });
                        }
                        Err(e) => {
                            for tx in waiters {
                                let _ = tx.send(());
                            }
                            return Err(e);
                        }
                    }
                    for tx in waiters {
                        let _ = tx.send(());
                    }
                    return Ok(());
                }
            }
        }
    }

    /// Reads and validates one tree page; mismatched headers reformat.
    async fn read_tree_page(&self, pbn: PhysicalBlockNumber) -> Result<BlockMapPage, ForestError> {
        let mut buf = vec![0u8; BLOCK_MAP_PAGE_BYTES];
        if let Err(source) = self.store.read_page(pbn, &mut buf).await {
            self.read_only.enter_read_only(source.to_string());
            return Err(ForestError::Io { source });
        }
        Ok(match BlockMapPage::decode(&buf, self.config.nonce, pbn) {
            PageValidity::Valid(page) => page,
            PageValidity::Invalid => {
                debug!(pbn, "tree page failed validation; reformatting empty");
                BlockMapPage::format(self.config.nonce, pbn)
            }
        })
    }

    /// Advances the writeback era to the journal's current point and
    /// writes every expired page. Returns the number written.
    pub async fn write_expired_pages(&self) -> Result<usize, ForestError> {
        let era_point = self.journal.current_era_point();
        let rolled = self.state.lock().dirty.advance_era(era_point);
        if rolled {
            // Generation rollover obliges a flush ahead of the era's
            // writes.
            if let Err(source) = self.store.flush().await {
                self.read_only.enter_read_only(source.to_string());
                return Err(ForestError::Io { source });
            }
        }
        self.drain_write_queue().await
    }

    /// Writes every dirty page regardless of era; shutdown and
    /// cache-pressure path.
    pub async fn flush_all(&self) -> Result<usize, ForestError> {
        self.state.lock().dirty.expire_all();
        self.drain_write_queue().await
    }

    async fn drain_write_queue(&self) -> Result<usize, ForestError> {
        let mut written = 0;
        loop {
            let (path, pbn, encoded, lock) = {
                let mut state = self.state.lock();
                let Some(path) = state.dirty.pop_expired() else {
                    break;
                };
                let Some(page) = state.pages.get_mut(&path) else {
                    self.read_only
                        .enter_read_only("expired page missing from arena");
                    return Err(ForestError::ReadOnly);
                };
                page.writing_recovery_lock = page.recovery_lock;
                page.recovery_lock = 0;
                let disk_page = BlockMapPage {
                    nonce: self.config.nonce,
                    pbn: page.pbn,
                    initialized: true,
                    entries: page.entries.clone(),
                };
                (path, page.pbn, disk_page.encode(), page.writing_recovery_lock)
            };

            if let Err(source) = self.store.write_page(pbn, &encoded).await {
                self.read_only.enter_read_only(source.to_string());
                return Err(ForestError::Io { source });
            }

            let acked = self.state.lock().dirty.write_acked(path);
            match acked {
                None => {
                    self.read_only
                        .enter_read_only("written page was not on a dirty list");
                    return Err(ForestError::ReadOnly);
                }
                Some(_redirtied) => {
                    if lock != 0 {
                        self.journal.release_lock(lock);
                    }
                    let mut state = self.state.lock();
                    if let Some(page) = state.pages.get_mut(&path) {
                        page.writing_recovery_lock = 0;
                    }
                }
            }
            written += 1;
        }
        Ok(written)
    }

    /// Dirty-page counts for diagnostics.
    pub fn dirty_page_count(&self) -> u64 {
        let state = self.state.lock();
        let mut total = 0;
        for generation in state.dirty.oldest_generation()..=state.dirty.generation() {
            total += state.dirty.dirty_count(generation);
        }
        total
    }
}
