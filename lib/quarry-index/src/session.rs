//! The index session: request lifecycle from hash to callback.
//!
//! Requests are routed by name to the zone that owns them; each zone is
//! one worker task processing its queue in arrival order. A request
//! checks the open chapter, then the volume index, then (on a chapter
//! hit) the chapter's pages through the volume cache. A cache miss does
//! not stall the zone: the request is parked, the page read is queued,
//! and the reader task restarts the request when the page arrives.
//!
//! Suspend is cooperative: zone queues drain, an optional save writes
//! the volume index and open chapter images, and resume may point the
//! session at a different (byte-identical) backing device.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use quarry_common::Status;
use snafu::{ResultExt, Snafu};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::chapter_index::{ChapterIndexError, OpenChapterIndex};
use crate::delta_index::DeltaIndexError;
use crate::geometry::Geometry;
use crate::layout::{IndexLayout, LayoutError, SavedState};
use crate::name::{RecordMetadata, RecordName};
use crate::open_chapter::{search_record_page, OpenChapter};
use crate::request::{Request, RequestKind, Response};
use crate::volume::device::BlockDevice;
use crate::volume::sparse_cache::{SparseCache, DEFAULT_SPARSE_CACHE_CAPACITY};
use crate::volume::{CachedSearch, Volume, VolumeError};
use crate::volume_index::{VolumeIndex, VolumeIndexError};

/// Hard ceiling on zone workers.
pub const MAX_ZONES: u32 = 16;

/// How an existing or fresh index is brought up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Format the device and start empty.
    Create,
    /// Load from the device; replay chapters if the last shutdown was
    /// not a clean save.
    Load,
    /// Load from the device but never replay; a dirty index comes up
    /// with an empty volume index.
    NoRebuild,
}

/// Per-session request counters.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionStats {
    pub requests: u64,
    pub posts_found: u64,
    pub posts_not_found: u64,
    pub updates_found: u64,
    pub updates_not_found: u64,
    pub queries_found: u64,
    pub queries_not_found: u64,
    pub entries_indexed: u64,
    pub entries_discarded: u64,
}

/// Session construction parameters. Zero means "use the default" for
/// every tunable.
#[derive(Clone)]
pub struct SessionParams {
    pub geometry: Geometry,
    pub nonce: u64,
    pub zone_count: u32,
    pub offset_bytes: u64,
    pub cache_slots: usize,
    pub reader_threads: usize,
    pub sparse_cache_capacity: usize,
}

impl SessionParams {
    pub fn new(geometry: Geometry, nonce: u64) -> Self {
        SessionParams {
            geometry,
            nonce,
            zone_count: 0,
            offset_bytes: 0,
            cache_slots: 0,
            reader_threads: 0,
            sparse_cache_capacity: 0,
        }
    }

    fn resolved_zone_count(&self) -> u32 {
        if self.zone_count != 0 {
            return self.zone_count.min(MAX_ZONES);
        }
        let cpus = std::thread::available_parallelism().map_or(1, |n| n.get() as u32);
        MAX_ZONES.min((cpus / 2).max(1))
    }

    fn resolved_cache_slots(&self) -> usize {
        if self.cache_slots != 0 {
            return self.cache_slots;
        }
        self.geometry.pages_per_chapter() as usize * 2
    }

    fn resolved_reader_threads(&self) -> usize {
        if self.reader_threads != 0 {
            self.reader_threads
        } else {
            2
        }
    }

    fn resolved_sparse_capacity(&self) -> usize {
        if self.sparse_cache_capacity != 0 {
            self.sparse_cache_capacity
        } else {
            DEFAULT_SPARSE_CACHE_CAPACITY
        }
    }
}

/// Error produced by session lifecycle operations.
#[derive(Debug, Snafu)]
pub enum SessionError {
    #[snafu(display("layout error: {}", source))]
    Layout { source: LayoutError },

    #[snafu(display("volume error: {}", source))]
    Volume { source: VolumeError },

    #[snafu(display("volume index error: {}", source))]
    Index { source: VolumeIndexError },

    #[snafu(display("chapter index error: {}", source))]
    Chapter { source: ChapterIndexError },

    #[snafu(display("invalid parameter: {}", reason))]
    InvalidParameter { reason: String },
}

fn status_of(error: &SessionError) -> Status {
    match error {
        SessionError::Layout { source: LayoutError::BadBlock { .. } } => Status::ChecksumMismatch,
        SessionError::Layout { .. } => Status::IoError,
        SessionError::Volume { source: VolumeError::Page { .. } } => Status::BadPage,
        SessionError::Volume { .. } => Status::IoError,
        SessionError::Index { .. } => Status::Overflow,
        SessionError::Chapter { .. } => Status::BadPage,
        SessionError::InvalidParameter { .. } => Status::InvalidArgument,
    }
}

enum ZoneMessage {
    Request(Request),
    Restart { parked: u64, ok: bool },
    Drain(oneshot::Sender<()>),
}

struct OpenState {
    chapter: OpenChapter,
    vcn: u64,
}

struct Shared {
    geometry: Geometry,
    params: SessionParams,
    layout: AsyncMutex<IndexLayout>,
    volume: SyncMutex<Arc<Volume>>,
    volume_index: VolumeIndex,
    open: AsyncMutex<OpenState>,
    /// Mirror of `open.vcn` for lock-free reads on the probe path.
    open_vcn: AtomicU64,
    sparse: SparseCache,
    stats: SyncMutex<SessionStats>,
    suspended: AtomicBool,
    parked: SyncMutex<HashMap<u64, Request>>,
    next_parked: AtomicU64,
}

impl Shared {
    fn volume(&self) -> Arc<Volume> {
        Arc::clone(&self.volume.lock())
    }

    fn is_sparse_chapter(&self, vcn: u64) -> bool {
        let open = self.open_vcn.load(Ordering::Acquire);
        self.geometry.is_sparse()
            && open.saturating_sub(vcn) > u64::from(self.geometry.dense_chapters_per_volume())
    }
}

/// A live deduplication index.
pub struct IndexSession {
    shared: Arc<Shared>,
    zone_txs: Vec<mpsc::UnboundedSender<ZoneMessage>>,
    workers: SyncMutex<Vec<JoinHandle<()>>>,
}

impl IndexSession {
    /// Formats the device and starts an empty session.
    pub async fn create(
        params: SessionParams,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Self, SessionError> {
        Self::open(params, device, OpenMode::Create).await
    }

    /// Brings up a session per the open mode.
    pub async fn open(
        params: SessionParams,
        device: Arc<dyn BlockDevice>,
        mode: OpenMode,
    ) -> Result<Self, SessionError> {
        if params.offset_bytes % params.geometry.bytes_per_page as u64 != 0 {
            return Err(SessionError::InvalidParameter {
                reason: format!(
                    "offset {} is not page aligned",
                    params.offset_bytes
                ),
            });
        }
        let base_page = params.offset_bytes / params.geometry.bytes_per_page as u64;
        let zone_count = params.resolved_zone_count();

        let (layout, volume_index, open_chapter_image, open_vcn, needs_recovery) = match mode {
            OpenMode::Create => {
                let layout =
                    IndexLayout::format(Arc::clone(&device), &params.geometry, params.nonce, base_page)
                        .await
                        .context(LayoutSnafu)?;
                let index = VolumeIndex::new(&params.geometry, zone_count);
                (layout, index, Vec::new(), 0, false)
            }
            OpenMode::Load | OpenMode::NoRebuild => {
                let layout = IndexLayout::load(Arc::clone(&device), base_page)
                    .await
                    .context(LayoutSnafu)?;
                let state = layout.load_state().await.context(LayoutSnafu)?;
                if state.clean {
                    let index = VolumeIndex::load_from(
                        layout.geometry(),
                        zone_count,
                        &state.volume_index_image,
                    )
                    .context(IndexSnafu)?;
                    (layout, index, state.open_chapter_image, state.open_vcn, false)
                } else {
                    let index = VolumeIndex::new(layout.geometry(), zone_count);
                    (layout, index, Vec::new(), 0, true)
                }
            }
        };

        let geometry = layout.geometry().clone();
        let volume = Volume::new(
            &geometry,
            Arc::clone(&device),
            layout.ring_base(),
            zone_count,
            params.resolved_cache_slots(),
            params.resolved_reader_threads(),
        );

        let mut open_vcn = open_vcn;
        let mut chapter = OpenChapter::new(&geometry);
        if !open_chapter_image.is_empty() {
            chapter.load_from(&open_chapter_image);
        }
        if needs_recovery {
            open_vcn = match mode {
                OpenMode::Load => replay_volume(&volume, &volume_index, &geometry).await?,
                _ => newest_on_disk(&volume, &geometry).await?.map_or(0, |v| v + 1),
            };
        }
        volume_index.rollover(open_vcn);
        layout.mark_dirty(open_vcn).await.context(LayoutSnafu)?;

        let sparse_capacity = params.resolved_sparse_capacity();
        let shared = Arc::new(Shared {
            geometry,
            params,
            layout: AsyncMutex::new(layout),
            volume: SyncMutex::new(volume),
            volume_index,
            open: AsyncMutex::new(OpenState {
                chapter,
                vcn: open_vcn,
            }),
            open_vcn: AtomicU64::new(open_vcn),
            sparse: SparseCache::new(sparse_capacity),
            stats: SyncMutex::new(SessionStats::default()),
            suspended: AtomicBool::new(false),
            parked: SyncMutex::new(HashMap::new()),
            next_parked: AtomicU64::new(0),
        });

        let mut zone_txs = Vec::with_capacity(zone_count as usize);
        let mut workers = Vec::with_capacity(zone_count as usize);
        for zone in 0..zone_count {
            let (tx, rx) = mpsc::unbounded_channel();
            let shared = Arc::clone(&shared);
            let worker_tx = tx.clone();
            workers.push(tokio::spawn(async move {
                zone_worker(shared, zone, rx, worker_tx).await;
            }));
            zone_txs.push(tx);
        }

        Ok(IndexSession {
            shared,
            zone_txs,
            workers: SyncMutex::new(workers),
        })
    }

    /// Routes a request to its zone. The callback fires on a worker
    /// task.
    pub fn submit(&self, request: Request) {
        self.shared.stats.lock().requests += 1;
        if self.shared.suspended.load(Ordering::Acquire) {
            request.complete(Status::Busy, false, None);
            return;
        }
        let zone = self.shared.volume_index.zone_for(&request.name);
        if let Err(mpsc::error::SendError(ZoneMessage::Request(request))) =
            self.zone_txs[zone as usize].send(ZoneMessage::Request(request))
        {
            request.complete(Status::ShuttingDown, false, None);
        }
    }

    /// Submits and awaits one request.
    pub async fn execute(
        &self,
        kind: RequestKind,
        name: RecordName,
        new_metadata: RecordMetadata,
    ) -> Response {
        let (tx, rx) = oneshot::channel();
        let mut tx = Some(tx);
        self.submit(Request::new(
            kind,
            name,
            new_metadata,
            Box::new(move |response| {
                let _ = tx.take().expect("single completion").send(response);
            }),
        ));
        rx.await.expect("request completes")
    }

    pub fn stats(&self) -> SessionStats {
        *self.shared.stats.lock()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.shared.geometry
    }

    /// The volume currently backing the session; exposed for tests that
    /// drive the cache latch directly.
    pub fn volume(&self) -> Arc<Volume> {
        self.shared.volume()
    }

    /// Drains all zones; with `save`, also writes a clean save image.
    pub async fn suspend(&self, save: bool) -> Result<(), SessionError> {
        self.shared.suspended.store(true, Ordering::Release);
        for tx in &self.zone_txs {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(ZoneMessage::Drain(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
        }
        if save {
            self.save_state().await?;
        }
        debug!(save, "index session suspended");
        Ok(())
    }

    /// Resumes request processing, optionally on a different device
    /// holding a byte-identical copy of the volume.
    pub async fn resume(&self, device: Option<Arc<dyn BlockDevice>>) -> Result<(), SessionError> {
        if let Some(device) = device {
            let mut layout = self.shared.layout.lock().await;
            let fresh = IndexLayout::load(Arc::clone(&device), layout.base_page())
                .await
                .context(LayoutSnafu)?;
            if fresh.geometry() != &self.shared.geometry || fresh.nonce() != layout.nonce() {
                return Err(SessionError::InvalidParameter {
                    reason: "replacement device does not hold this index".to_string(),
                });
            }
            let old = self.shared.volume();
            old.shutdown().await;
            let volume = Volume::new(
                &self.shared.geometry,
                device,
                fresh.ring_base(),
                self.shared.volume_index.zone_count(),
                self.shared.params.resolved_cache_slots(),
                self.shared.params.resolved_reader_threads(),
            );
            *self.shared.volume.lock() = volume;
            fresh
                .mark_dirty(self.shared.open_vcn.load(Ordering::Acquire))
                .await
                .context(LayoutSnafu)?;
            *layout = fresh;
        }
        self.shared.suspended.store(false, Ordering::Release);
        debug!("index session resumed");
        Ok(())
    }

    /// Suspends, optionally saves, and tears the session down.
    pub async fn close(mut self, save: bool) -> Result<(), SessionError> {
        self.suspend(save).await?;
        drop(std::mem::take(&mut self.zone_txs));
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        futures::future::join_all(workers).await;
        self.shared.volume().shutdown().await;
        Ok(())
    }

    async fn save_state(&self) -> Result<(), SessionError> {
        let open = self.shared.open.lock().await;
        let mut volume_index_image = Vec::new();
        self.shared.volume_index.save_to(&mut volume_index_image);
        let mut open_chapter_image = Vec::new();
        open.chapter.save_to(&mut open_chapter_image);
        let layout = self.shared.layout.lock().await;
        layout
            .save_state(&SavedState {
                open_vcn: open.vcn,
                clean: true,
                volume_index_image,
                open_chapter_image,
            })
            .await
            .context(LayoutSnafu)
    }

    /// Moves a cleanly saved index so its first region starts past
    /// `lvm_offset_bytes`, shrinking the ring by one chapter to pay for
    /// the headroom. Returns the new byte offset to configure.
    pub async fn convert_to_lvm(
        device: Arc<dyn BlockDevice>,
        current_offset_bytes: u64,
        lvm_offset_bytes: u64,
    ) -> Result<u64, SessionError> {
        let page_size = device.page_size() as u64;
        let old_base = current_offset_bytes / page_size;
        let layout = IndexLayout::load(Arc::clone(&device), old_base)
            .await
            .context(LayoutSnafu)?;
        let state = layout.load_state().await.context(LayoutSnafu)?;
        if !state.clean {
            return Err(SessionError::InvalidParameter {
                reason: "index must be cleanly saved before conversion".to_string(),
            });
        }
        let old_geometry = layout.geometry().clone();
        let nonce = layout.nonce();
        let new_base = lvm_offset_bytes.div_ceil(page_size);
        if new_base.saturating_sub(old_base) > u64::from(old_geometry.pages_per_chapter()) {
            return Err(SessionError::InvalidParameter {
                reason: "offset exceeds the space freed by one chapter".to_string(),
            });
        }
        let mut reduced = old_geometry.clone();
        reduced.chapters_per_volume -= 1;

        // Stage every still-live chapter before touching the device;
        // the old and new regions overlap.
        let old_ring = layout.ring_base();
        let pages_per_chapter = old_geometry.pages_per_chapter();
        let mut staged: Vec<(u64, Vec<Vec<u8>>)> = Vec::new();
        for slot in 0..old_geometry.chapters_per_volume {
            let first = old_ring + u64::from(slot) * u64::from(pages_per_chapter);
            let mut head = vec![0u8; old_geometry.bytes_per_page];
            device.read_page(first, &mut head).await.map_err(|source| {
                SessionError::Layout {
                    source: LayoutError::Io { source },
                }
            })?;
            let Ok(page) = crate::chapter_index::ChapterIndexPage::parse(&head, &old_geometry)
            else {
                continue;
            };
            let vcn = page.vcn;
            if old_geometry.physical_chapter(vcn) != slot
                || reduced.has_aged_out(vcn, state.open_vcn)
            {
                continue;
            }
            let mut pages = Vec::with_capacity(pages_per_chapter as usize);
            for i in 0..pages_per_chapter {
                let mut buf = vec![0u8; old_geometry.bytes_per_page];
                device
                    .read_page(first + u64::from(i), &mut buf)
                    .await
                    .map_err(|source| SessionError::Layout {
                        source: LayoutError::Io { source },
                    })?;
                pages.push(buf);
            }
            staged.push((vcn, pages));
        }
        info!(
            chapters = staged.len(),
            new_base, "converting index for LVM headroom"
        );

        let new_layout = IndexLayout::format(Arc::clone(&device), &reduced, nonce, new_base)
            .await
            .context(LayoutSnafu)?;
        let new_ring = new_layout.ring_base();
        for (vcn, pages) in &staged {
            let slot = reduced.physical_chapter(*vcn);
            let first = new_ring + u64::from(slot) * u64::from(pages_per_chapter);
            for (i, page) in pages.iter().enumerate() {
                device
                    .write_page(first + i as u64, page)
                    .await
                    .map_err(|source| SessionError::Layout {
                        source: LayoutError::Io { source },
                    })?;
            }
        }
        new_layout.save_state(&state).await.context(LayoutSnafu)?;
        Ok(new_base * page_size)
    }
}

impl Drop for IndexSession {
    fn drop(&mut self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }
}

/// Finds the newest chapter on disk without replaying anything.
async fn newest_on_disk(
    volume: &Volume,
    geometry: &Geometry,
) -> Result<Option<u64>, SessionError> {
    let mut newest = None;
    for slot in 0..geometry.chapters_per_volume {
        if let Some(vcn) = volume.chapter_in_slot(slot).await.context(VolumeSnafu)? {
            newest = newest.max(Some(vcn));
        }
    }
    Ok(newest)
}

/// Rebuilds the volume index by scanning chapters in virtual order.
///
/// Record pages carry the full names, so the scan reads them directly;
/// sparse chapters contribute only their hooks, dense chapters
/// everything.
async fn replay_volume(
    volume: &Volume,
    index: &VolumeIndex,
    geometry: &Geometry,
) -> Result<u64, SessionError> {
    let mut vcns = Vec::new();
    for slot in 0..geometry.chapters_per_volume {
        if let Some(vcn) = volume.chapter_in_slot(slot).await.context(VolumeSnafu)? {
            vcns.push(vcn);
        }
    }
    vcns.sort_unstable();
    let Some(&newest) = vcns.last() else {
        return Ok(0);
    };
    let open_vcn = newest + 1;
    index.rollover(open_vcn);

    for &vcn in &vcns {
        if geometry.has_aged_out(vcn, open_vcn) {
            continue;
        }
        let dense = open_vcn - vcn <= u64::from(geometry.dense_chapters_per_volume());
        let mut restored = 0u64;
        for record_page in 0..geometry.record_pages_per_chapter {
            let data = volume
                .read_record_page(vcn, record_page)
                .await
                .context(VolumeSnafu)?;
            for record in data.chunks_exact(32) {
                let name = RecordName(record[..16].try_into().expect("16 bytes"));
                if name.0 == [0xff; 16] {
                    continue;
                }
                if dense || name.is_hook(geometry) {
                    if index.put_record(&name, vcn).is_ok() {
                        restored += 1;
                    }
                }
            }
        }
        debug!(vcn, restored, "replayed chapter");
    }
    Ok(open_vcn)
}

async fn zone_worker(
    shared: Arc<Shared>,
    zone: u32,
    mut rx: mpsc::UnboundedReceiver<ZoneMessage>,
    tx: mpsc::UnboundedSender<ZoneMessage>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            ZoneMessage::Request(request) => {
                process_request(&shared, zone, request, &tx).await;
            }
            ZoneMessage::Restart { parked, ok } => {
                let Some(request) = shared.parked.lock().remove(&parked) else {
                    continue;
                };
                if ok {
                    process_request(&shared, zone, request, &tx).await;
                } else {
                    request.complete(Status::IoError, false, None);
                }
            }
            ZoneMessage::Drain(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

async fn process_request(
    shared: &Arc<Shared>,
    zone: u32,
    request: Request,
    tx: &mpsc::UnboundedSender<ZoneMessage>,
) {
    let geometry = &shared.geometry;

    // Step one: the open chapter.
    {
        let mut open = shared.open.lock().await;
        if let Some(&old) = open.chapter.get(&request.name) {
            let mut stats = shared.stats.lock();
            match request.kind {
                RequestKind::Post => stats.posts_found += 1,
                RequestKind::Update => stats.updates_found += 1,
                RequestKind::Query | RequestKind::QueryNoUpdate => stats.queries_found += 1,
            }
            drop(stats);
            if request.kind == RequestKind::Update {
                open.chapter.put(request.name, request.new_metadata);
            }
            request.complete(Status::Success, true, Some(old));
            return;
        }
    }

    // Step two: the volume index.
    if let Some(vcn) = shared.volume_index.get_record(&request.name) {
        let open_vcn = shared.open_vcn.load(Ordering::Acquire);
        if vcn < open_vcn {
            let volume = shared.volume();
            match volume.search_cached(vcn, &request.name, zone).await {
                Err(e) => {
                    warn!(vcn, error = %e, "chapter search failed");
                    let status = status_of(&SessionError::Volume { source: e });
                    request.complete(status, false, None);
                    return;
                }
                Ok(CachedSearch::Found(old)) => {
                    found_in_chapter(shared, request, vcn, old).await;
                    return;
                }
                Ok(CachedSearch::NeedsPage(pbn)) => {
                    park_request(shared, request, pbn, tx);
                    return;
                }
                Ok(CachedSearch::NotFound) => {}
            }
        }
    }

    // Step three: the sparse cache, for names the volume index does not
    // track.
    if geometry.is_sparse() && !request.name.is_hook(geometry) {
        if let Some((vcn, record_page)) = shared.sparse.search(&request.name, geometry) {
            let volume = shared.volume();
            if let Ok(data) = volume.read_record_page(vcn, record_page).await {
                if let Some(old) = search_record_page(&data, &request.name) {
                    found_in_chapter(shared, request, vcn, old).await;
                    return;
                }
            }
        }
    }

    not_found(shared, request).await;
}

fn park_request(shared: &Arc<Shared>, request: Request, pbn: u64, tx: &mpsc::UnboundedSender<ZoneMessage>) {
    let id = shared.next_parked.fetch_add(1, Ordering::Relaxed);
    shared.parked.lock().insert(id, request);
    let restart_tx = tx.clone();
    let queued = shared.volume().cache().enqueue_read(
        pbn,
        Box::new(move |ok| {
            let _ = restart_tx.send(ZoneMessage::Restart { parked: id, ok });
        }),
    );
    if !queued {
        // Pending queue full; the caller owns the fallback.
        if let Some(request) = shared.parked.lock().remove(&id) {
            request.complete(Status::Queued, false, None);
        }
    }
}

/// A record was found in a closed chapter: count it, renew it, and feed
/// the sparse cache if it lives in the sparse half of the ring.
async fn found_in_chapter(
    shared: &Arc<Shared>,
    request: Request,
    vcn: u64,
    old: RecordMetadata,
) {
    {
        let mut stats = shared.stats.lock();
        match request.kind {
            RequestKind::Post => stats.posts_found += 1,
            RequestKind::Update => stats.updates_found += 1,
            RequestKind::Query | RequestKind::QueryNoUpdate => stats.queries_found += 1,
        }
    }

    if shared.is_sparse_chapter(vcn) && request.name.is_hook(&shared.geometry) {
        if !shared.sparse.touch(vcn) {
            let volume = shared.volume();
            if let Ok(Some(pages)) = volume.read_chapter_index(vcn).await {
                shared.sparse.insert(vcn, pages);
            }
        }
    }

    let renewal = match request.kind {
        RequestKind::Post | RequestKind::Query => Some(old),
        RequestKind::Update => Some(request.new_metadata),
        RequestKind::QueryNoUpdate => None,
    };
    if let Some(metadata) = renewal {
        if let Err(e) = index_record(shared, request.name, metadata, true).await {
            warn!(error = %e, "renewal failed");
            request.complete(status_of(&e), true, Some(old));
            return;
        }
    }
    request.complete(Status::Success, true, Some(old));
}

async fn not_found(shared: &Arc<Shared>, request: Request) {
    {
        let mut stats = shared.stats.lock();
        match request.kind {
            RequestKind::Post => stats.posts_not_found += 1,
            RequestKind::Update => stats.updates_not_found += 1,
            RequestKind::Query | RequestKind::QueryNoUpdate => stats.queries_not_found += 1,
        }
    }
    match request.kind {
        RequestKind::Post | RequestKind::Update => {
            if let Err(e) = index_record(shared, request.name, request.new_metadata, false).await {
                warn!(error = %e, "index insert failed");
                request.complete(status_of(&e), false, None);
                return;
            }
            request.complete(Status::Success, false, None);
        }
        RequestKind::Query | RequestKind::QueryNoUpdate => {
            request.complete(Status::Success, false, None);
        }
    }
}

/// Adds (or renews) a record in the open chapter and the volume index,
/// closing the chapter when it fills.
async fn index_record(
    shared: &Arc<Shared>,
    name: RecordName,
    metadata: RecordMetadata,
    renewal: bool,
) -> Result<(), SessionError> {
    let mut open = shared.open.lock().await;
    if open.chapter.is_full() {
        // A previous close failed and left the chapter full; retry it
        // before accepting more records.
        close_open_chapter(shared, &mut open).await?;
    }
    let was_new = open.chapter.put(name, metadata);
    if was_new {
        shared.stats.lock().entries_indexed += 1;
    }
    let vcn = open.vcn;
    let result = if renewal {
        shared.volume_index.update_record(&name, vcn)
    } else {
        shared.volume_index.put_record(&name, vcn)
    };
    if let Err(e) = result {
        // A full volume index degrades dedup; it does not fail writes.
        shared.stats.lock().entries_discarded += 1;
        debug!(error = %e, "volume index insert dropped");
    }
    if open.chapter.is_full() {
        close_open_chapter(shared, &mut open).await?;
    }
    Ok(())
}

/// Closes the open chapter: sort, index, pack, write, advance.
async fn close_open_chapter(
    shared: &Arc<Shared>,
    open: &mut OpenState,
) -> Result<(), SessionError> {
    let geometry = &shared.geometry;
    let closed = open.chapter.close(geometry);
    let mut chapter_index = OpenChapterIndex::new(geometry, open.vcn);
    for (i, (name, _)) in closed.records.iter().enumerate() {
        match chapter_index.put(name, closed.page_of[i]) {
            Ok(()) => {}
            Err(DeltaIndexError::Overflow { .. }) => {
                // The on-disk format is lossy at this density; drop the
                // record from the chapter index only.
                shared.stats.lock().entries_discarded += 1;
            }
            Err(e) => {
                return Err(SessionError::Chapter {
                    source: ChapterIndexError::Delta { source: e },
                })
            }
        }
    }
    let index_pages = chapter_index.pack().context(ChapterSnafu)?;
    let volume = shared.volume();
    volume
        .write_chapter(open.vcn, &index_pages, &closed.pages)
        .await
        .context(VolumeSnafu)?;

    let new_vcn = open.vcn + 1;
    if new_vcn >= u64::from(geometry.chapters_per_volume) {
        volume
            .forget_chapter(new_vcn - u64::from(geometry.chapters_per_volume))
            .await;
    }
    shared.volume_index.rollover(new_vcn);
    if geometry.is_sparse() {
        let oldest_live = new_vcn.saturating_sub(u64::from(geometry.chapters_per_volume) - 1);
        shared.sparse.invalidate_before(oldest_live);
    }
    open.vcn = new_vcn;
    shared.open_vcn.store(new_vcn, Ordering::Release);
    open.chapter.reset();
    debug!(vcn = new_vcn - 1, "closed chapter");
    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::geometry::tests_support::{tiny_geometry, tiny_sparse_geometry};
    use crate::volume::device::MemoryDevice;

    fn name_of(i: u32) -> RecordName {
        RecordName::from_content(&i.to_le_bytes())
    }

    fn meta_of(i: u32) -> RecordMetadata {
        let mut m = [0u8; 16];
        m[..4].copy_from_slice(&i.to_le_bytes());
        m
    }

    async fn session_on(
        geometry: Geometry,
        device: Arc<MemoryDevice>,
        mode: OpenMode,
    ) -> IndexSession {
        let mut params = SessionParams::new(geometry, 0x51);
        params.zone_count = 2;
        IndexSession::open(params, device as _, mode).await.unwrap()
    }

    async fn post(session: &IndexSession, i: u32) -> Response {
        session.execute(RequestKind::Post, name_of(i), meta_of(i)).await
    }

    #[tokio::test]
    async fn post_then_repost_counts() {
        let geometry = tiny_geometry();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry, device, OpenMode::Create).await;

        for i in 0..101 {
            let response = post(&session, i).await;
            assert_eq!(response.status, Status::Success);
            assert!(!response.found);
        }
        for i in 0..53 {
            let response = post(&session, i).await;
            assert!(response.found, "repost {i}");
            assert_eq!(response.old_metadata, Some(meta_of(i)));
        }
        let stats = session.stats();
        assert_eq!(stats.posts_not_found, 101);
        assert_eq!(stats.posts_found, 53);
        assert_eq!(stats.entries_indexed, 101);
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn records_survive_chapter_close() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry, device, OpenMode::Create).await;

        // Two and a half chapters of distinct names.
        let total = per_chapter * 5 / 2;
        for i in 0..total {
            post(&session, i).await;
        }
        for i in 0..total {
            let response = session
                .execute(RequestKind::Query, name_of(i), [0u8; 16])
                .await;
            assert!(response.found, "record {i} must be retrievable");
            assert_eq!(response.old_metadata, Some(meta_of(i)));
        }
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn aging_forgets_oldest_records() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let window = geometry.records_per_volume() as u32;
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), device, OpenMode::Create).await;

        // Overfill the ring by two chapters.
        let total = window + 2 * per_chapter;
        for i in 0..total {
            post(&session, i).await;
        }
        // The oldest two chapters have aged out.
        let response = session
            .execute(RequestKind::QueryNoUpdate, name_of(0), [0u8; 16])
            .await;
        assert!(!response.found);
        // The most recent window, minus the open chapter still being
        // filled, is retrievable.
        let recent = total - per_chapter;
        let response = session
            .execute(RequestKind::QueryNoUpdate, name_of(recent), [0u8; 16])
            .await;
        assert!(response.found);
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn update_overwrites_metadata() {
        let geometry = tiny_geometry();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry, device, OpenMode::Create).await;

        post(&session, 9).await;
        let response = session
            .execute(RequestKind::Update, name_of(9), meta_of(999))
            .await;
        assert!(response.found);
        assert_eq!(response.old_metadata, Some(meta_of(9)));
        let response = session
            .execute(RequestKind::QueryNoUpdate, name_of(9), [0u8; 16])
            .await;
        assert_eq!(response.old_metadata, Some(meta_of(999)));

        let stats = session.stats();
        assert_eq!(stats.updates_found, 1);
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn save_and_reload_clean() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), Arc::clone(&device), OpenMode::Create).await;
        let total = per_chapter * 3 / 2;
        for i in 0..total {
            post(&session, i).await;
        }
        session.close(true).await.unwrap();

        let session = session_on(geometry, device, OpenMode::Load).await;
        for i in 0..total {
            let response = post(&session, i).await;
            assert!(response.found, "record {i} must survive reload");
        }
        assert_eq!(session.stats().posts_found, u64::from(total));
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn dirty_load_replays_chapters() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), Arc::clone(&device), OpenMode::Create).await;
        let total = per_chapter * 2;
        for i in 0..total {
            post(&session, i).await;
        }
        // No save: the state block stays dirty.
        session.close(false).await.unwrap();

        let session = session_on(geometry, device, OpenMode::Load).await;
        for i in 0..total {
            let response = post(&session, i).await;
            assert!(response.found, "closed-chapter record {i} must replay");
        }
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn no_rebuild_skips_replay() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), Arc::clone(&device), OpenMode::Create).await;
        for i in 0..per_chapter * 2 {
            post(&session, i).await;
        }
        session.close(false).await.unwrap();

        let session = session_on(geometry, device, OpenMode::NoRebuild).await;
        let response = session
            .execute(RequestKind::QueryNoUpdate, name_of(0), [0u8; 16])
            .await;
        assert!(!response.found, "no-rebuild must not replay");
        // Chapter numbering still advances past what is on disk.
        post(&session, 100_000).await;
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn suspend_resume_on_copied_device() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), Arc::clone(&device), OpenMode::Create).await;
        let total = per_chapter * 5 / 2;
        for i in 0..total {
            post(&session, i).await;
        }
        session.suspend(true).await.unwrap();

        let copy = Arc::new(device.snapshot());
        session.resume(Some(copy as _)).await.unwrap();
        for i in 0..total {
            let response = post(&session, i).await;
            assert!(response.found, "record {i} must be on the copied device");
        }
        assert_eq!(session.stats().posts_found, u64::from(total));
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn suspended_session_rejects_requests() {
        let geometry = tiny_geometry();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry, device, OpenMode::Create).await;
        session.suspend(false).await.unwrap();
        let response = post(&session, 1).await;
        assert_eq!(response.status, Status::Busy);
        session.resume(None).await.unwrap();
        let response = post(&session, 1).await;
        assert_eq!(response.status, Status::Success);
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn sparse_hooks_route_companions() {
        let geometry = tiny_sparse_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), Arc::clone(&device), OpenMode::Create).await;

        // Fill several chapters, then age them into the sparse half.
        let total = per_chapter * (geometry.chapters_per_volume - 2);
        for i in 0..total {
            post(&session, i).await;
        }
        // Hooks from early (now sparse) chapters stay findable via the
        // volume index; their lookups also prime the sparse cache.
        let mut hook_hits = 0;
        for i in 0..per_chapter {
            let name = name_of(i);
            if !name.is_hook(&geometry) {
                continue;
            }
            let response = session
                .execute(RequestKind::QueryNoUpdate, name, [0u8; 16])
                .await;
            if response.found {
                hook_hits += 1;
            }
        }
        assert!(hook_hits > 0, "some early hooks must survive");
        session.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn lvm_conversion_preserves_live_records() {
        let geometry = tiny_geometry();
        let per_chapter = geometry.records_per_chapter();
        let device = Arc::new(MemoryDevice::new(geometry.bytes_per_page));
        let session = session_on(geometry.clone(), Arc::clone(&device), OpenMode::Create).await;
        let total = per_chapter * 3;
        for i in 0..total {
            post(&session, i).await;
        }
        session.close(true).await.unwrap();

        let offset = IndexSession::convert_to_lvm(
            Arc::clone(&device) as _,
            0,
            2 * geometry.bytes_per_page as u64,
        )
        .await
        .unwrap();
        assert_eq!(offset % geometry.bytes_per_page as u64, 0);

        let mut reduced = geometry.clone();
        reduced.chapters_per_volume -= 1;
        let mut params = SessionParams::new(reduced, 0x51);
        params.zone_count = 2;
        params.offset_bytes = offset;
        let session = IndexSession::open(params, device as _, OpenMode::Load)
            .await
            .unwrap();
        for i in 0..total {
            let response = post(&session, i).await;
            assert!(response.found, "record {i} must survive conversion");
        }
        session.close(false).await.unwrap();
    }
}
