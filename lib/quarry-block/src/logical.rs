//! The logical zone: per-LBN serialization over the forest, the
//! allocator, and the journal.
//!
//! Operations on one logical block serialize through the zone's LBN
//! lock map: the first arrival holds the lock, later arrivals park on
//! it. A read that arrives while a write holds the lock is satisfied
//! from the writer's data buffer directly, so reads never wait behind
//! an allocation in flight.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use quarry_common::{LogicalBlockNumber, Status};
use snafu::Snafu;
use tokio::sync::oneshot;

use crate::data_vio::DataVioPool;
use crate::entry::{BlockMapEntry, BlockMapState};
use crate::forest::{Forest, ForestError};
use crate::journal::{JournalEntry, JournalEntryKind};
use crate::read_only::ReadOnlyNotifier;
use crate::slab::{PhysicalAllocator, SlabError};

/// Error produced by block-layer operations.
#[derive(Debug, Snafu)]
pub enum BlockError {
    /// The layer is read-only.
    #[snafu(display("block layer is read-only"))]
    ReadOnly,

    /// The depot has no free blocks.
    #[snafu(display("out of physical space"))]
    NoSpace,

    /// A mapping failed validation on the read path.
    #[snafu(display("bad mapping: {}", reason))]
    BadMapping { reason: String },

    /// Metadata I/O failed.
    #[snafu(display("metadata I/O failure"))]
    Io,
}

impl BlockError {
    pub fn status(&self) -> Status {
        match self {
            BlockError::ReadOnly => Status::ReadOnly,
            BlockError::NoSpace => Status::NoSpace,
            BlockError::BadMapping { .. } => Status::BadMapping,
            BlockError::Io => Status::IoError,
        }
    }

    fn from_forest(error: ForestError, read_only: &ReadOnlyNotifier) -> Self {
        match error {
            ForestError::ReadOnly => BlockError::ReadOnly,
            ForestError::Slab {
                source: SlabError::NoSpace,
            } => BlockError::NoSpace,
            ForestError::Slab { source } => {
                read_only.enter_read_only(source.to_string());
                BlockError::ReadOnly
            }
            ForestError::BadMapping { reason, .. } => BlockError::BadMapping { reason },
            ForestError::Io { .. } => BlockError::Io,
        }
    }
}

/// What a read produced.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    /// The block is unmapped; logically zero.
    Unmapped,
    /// The block maps to this entry; data lives on the physical block.
    Mapped(BlockMapEntry),
    /// A write to the same block is in flight; its buffer answers the
    /// read directly.
    FromWriter(Arc<Vec<u8>>),
}

struct LbnLock {
    /// The writer's data once its allocation succeeded; readers copy
    /// from here without waiting.
    writer_data: Option<Arc<Vec<u8>>>,
    waiters: Vec<oneshot::Sender<()>>,
}

/// The logical half of the block layer: LBN locks in front of the
/// forest.
pub struct BlockLayer {
    forest: Arc<Forest>,
    allocator: Arc<dyn PhysicalAllocator>,
    pool: Arc<DataVioPool>,
    read_only: Arc<ReadOnlyNotifier>,
    lbn_locks: Mutex<HashMap<LogicalBlockNumber, LbnLock>>,
}

impl BlockLayer {
    pub fn new(
        forest: Arc<Forest>,
        allocator: Arc<dyn PhysicalAllocator>,
        pool: Arc<DataVioPool>,
        read_only: Arc<ReadOnlyNotifier>,
    ) -> Self {
        BlockLayer {
            forest,
            allocator,
            pool,
            read_only,
            lbn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<DataVioPool> {
        &self.pool
    }

    pub fn forest(&self) -> &Arc<Forest> {
        &self.forest
    }

    /// Writes one block: acquire the LBN lock, allocate, journal, remap,
    /// and release the old block's reference.
    pub async fn write_block(
        &self,
        lbn: LogicalBlockNumber,
        data: &[u8],
    ) -> Result<(), BlockError> {
        self.write_block_gated(lbn, data, None).await
    }

    /// Unmaps one block, releasing the reference its mapping held.
    pub async fn discard_block(&self, lbn: LogicalBlockNumber) -> Result<(), BlockError> {
        if self.read_only.is_read_only() {
            return Err(BlockError::ReadOnly);
        }
        let vio = self.pool.acquire(true).await;
        self.lock_lbn(lbn).await;
        let result = self.remap(lbn, BlockMapEntry::UNMAPPED).await;
        self.unlock_lbn(lbn);
        self.pool.release(vio);
        result
    }

    /// Reads one block's mapping. A concurrent writer on the same LBN
    /// answers from its buffer without blocking the reader.
    pub async fn read_block(&self, lbn: LogicalBlockNumber) -> Result<ReadOutcome, BlockError> {
        {
            let locks = self.lbn_locks.lock();
            if let Some(lock) = locks.get(&lbn) {
                if let Some(data) = &lock.writer_data {
                    return Ok(ReadOutcome::FromWriter(Arc::clone(data)));
                }
            }
        }
        let entry = self
            .forest
            .lookup(lbn)
            .await
            .map_err(|e| BlockError::from_forest(e, &self.read_only))?;
        if entry.is_mapped() {
            Ok(ReadOutcome::Mapped(entry))
        } else {
            Ok(ReadOutcome::Unmapped)
        }
    }

    /// Write with an optional gate held while the LBN lock and the
    /// writer's buffer are published; lets tests overlap a read with an
    /// in-flight write deterministically.
    pub(crate) async fn write_block_gated(
        &self,
        lbn: LogicalBlockNumber,
        data: &[u8],
        gate: Option<oneshot::Receiver<()>>,
    ) -> Result<(), BlockError> {
        if self.read_only.is_read_only() {
            return Err(BlockError::ReadOnly);
        }
        let mut vio = self.pool.acquire(false).await;
        vio.lbn = Some(lbn);
        vio.data[..data.len()].copy_from_slice(data);

        self.lock_lbn(lbn).await;
        // Allocation succeeded implicitly when remap allocates; publish
        // the buffer first so overlapping reads are served from it.
        {
            let mut locks = self.lbn_locks.lock();
            let lock = locks.get_mut(&lbn).expect("lock held");
            lock.writer_data = Some(Arc::new(vio.data.clone()));
        }
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        let allocated = match self.allocator.allocate() {
            Ok(pbn) => pbn,
            Err(SlabError::NoSpace) => {
                self.unlock_lbn(lbn);
                self.pool.release(vio);
                return Err(BlockError::NoSpace);
            }
            Err(e) => {
                self.read_only.enter_read_only(e.to_string());
                self.unlock_lbn(lbn);
                self.pool.release(vio);
                return Err(BlockError::ReadOnly);
            }
        };
        let entry = BlockMapEntry::new(allocated, BlockMapState::Uncompressed)
            .expect("fresh allocation is encodable");
        let result = self.remap(lbn, entry).await;

        self.unlock_lbn(lbn);
        self.pool.release(vio);
        result
    }

    /// Updates the block map and settles references: the new mapping
    /// was counted at allocation; the old one, if any, is decremented.
    async fn remap(
        &self,
        lbn: LogicalBlockNumber,
        entry: BlockMapEntry,
    ) -> Result<(), BlockError> {
        let old = self
            .forest
            .update(lbn, entry)
            .await
            .map_err(|e| BlockError::from_forest(e, &self.read_only))?;
        if old.is_mapped() {
            if let Err(e) = self.allocator.adjust_reference(old.pbn, false) {
                // Underflow is a logic violation; latch read-only.
                self.read_only.enter_read_only(e.to_string());
                return Err(BlockError::ReadOnly);
            }
        }
        Ok(())
    }

    /// Replays recovery-journal entries into the block map after a
    /// dirty open: data-mapping increments are re-applied, decrements
    /// are honored when the map still points at the journaled block.
    /// Tree-page entries need no replay; interior pages rebuild (or
    /// reformat) on load. Returns the number of entries applied.
    pub async fn replay_journal(
        &self,
        entries: &[JournalEntry],
    ) -> Result<usize, BlockError> {
        let mut applied = 0;
        for entry in entries {
            if entry.kind != JournalEntryKind::DataMapping {
                continue;
            }
            if entry.increment {
                let mapping = BlockMapEntry::new(entry.pbn, BlockMapState::Uncompressed)
                    .map_err(|e| BlockError::BadMapping {
                        reason: e.to_string(),
                    })?;
                let old = self
                    .forest
                    .update(entry.lbn, mapping)
                    .await
                    .map_err(|e| BlockError::from_forest(e, &self.read_only))?;
                if old.is_mapped() && old.pbn != entry.pbn {
                    let _ = self.allocator.adjust_reference(old.pbn, false);
                }
            } else {
                let current = self
                    .forest
                    .lookup(entry.lbn)
                    .await
                    .map_err(|e| BlockError::from_forest(e, &self.read_only))?;
                if current.is_mapped() && current.pbn == entry.pbn {
                    self.forest
                        .update(entry.lbn, BlockMapEntry::UNMAPPED)
                        .await
                        .map_err(|e| BlockError::from_forest(e, &self.read_only))?;
                    let _ = self.allocator.adjust_reference(entry.pbn, false);
                }
            }
            applied += 1;
        }
        debug!(applied, "replayed journal into the block map");
        Ok(applied)
    }

    async fn lock_lbn(&self, lbn: LogicalBlockNumber) {
        loop {
            let rx = {
                let mut locks = self.lbn_locks.lock();
                match locks.get_mut(&lbn) {
                    None => {
                        locks.insert(
                            lbn,
                            LbnLock {
                                writer_data: None,
                                waiters: Vec::new(),
                            },
                        );
                        return;
                    }
                    Some(lock) => {
                        let (tx, rx) = oneshot::channel();
                        lock.waiters.push(tx);
                        rx
                    }
                }
            };
            let _ = rx.await;
        }
    }

    fn unlock_lbn(&self, lbn: LogicalBlockNumber) {
        let waiters = {
            let mut locks = self.lbn_locks.lock();
            let lock = locks.remove(&lbn).expect("lock held");
            lock.waiters
        };
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}
