//! The volume page cache: a fixed set of slots in front of the chapter
//! ring, with an asynchronous read queue serviced by reader tasks.
//!
//! Lookups come in two flavours. Reader tasks and other internal paths
//! insert pages directly under the cache lock. Request processing uses
//! the lock-free protected path: bracket the probe with
//! `begin_pending_search` / `end_pending_search`, and on a miss park the
//! request on the pending-read queue. A reader task performs the I/O,
//! installs the page, and restarts every parked waiter.
//!
//! Invalidation (a chapter slot being reused) removes the page under the
//! lock and then waits until no zone still has a pending search on that
//! page, so a protected reader that saw the page before the invalidation
//! finishes its probe before the slot's storage is reused.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Upper bound on parked reads; beyond it the submitter is told to back
/// off and retry.
pub const VOLUME_CACHE_MAX_QUEUED_READS: usize = 4096;

/// Completion carried back to a parked request. `true` means the page
/// was read and installed; `false` means the read failed and the request
/// should complete with an I/O error.
pub type ReadWaiter = Box<dyn FnOnce(bool) + Send + 'static>;

/// A page held by the cache.
pub struct CachedPage {
    pub pbn: u64,
    pub data: Vec<u8>,
}

/// Outcome of a protected cache probe.
pub enum ProtectedRead {
    /// The page was resident.
    Hit(Arc<CachedPage>),
    /// The page was missing; the waiter is parked on the read queue.
    Queued,
    /// The pending-read queue is full; the waiter was not parked.
    QueueFull,
}

#[derive(Default)]
struct Slot {
    page: Option<Arc<CachedPage>>,
}

struct Pending {
    queue: VecDeque<u64>,
    waiters: HashMap<u64, Vec<ReadWaiter>>,
}

pub struct PageCache {
    slots: Vec<Mutex<Slot>>,
    /// Per-zone most-recent hit, invalidated alongside the main slots.
    recent: Vec<Mutex<Option<Arc<CachedPage>>>>,
    /// Per-zone pending-search marker: page number plus one, zero when
    /// idle.
    searching: Vec<AtomicU64>,
    pending: Mutex<Pending>,
    /// Wakes reader tasks when reads are queued or the latch opens.
    reader_notify: Notify,
    /// Test latch: while set, reader tasks leave the queue alone.
    read_threads_stopped: AtomicBool,
    shutdown: AtomicBool,
}

impl PageCache {
    pub fn new(slot_count: usize, zone_count: usize) -> Arc<Self> {
        assert!(slot_count > 0 && zone_count > 0);
        Arc::new(PageCache {
            slots: (0..slot_count).map(|_| Mutex::new(Slot::default())).collect(),
            recent: (0..zone_count).map(|_| Mutex::new(None)).collect(),
            searching: (0..zone_count).map(|_| AtomicU64::new(0)).collect(),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                waiters: HashMap::new(),
            }),
            reader_notify: Notify::new(),
            read_threads_stopped: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        })
    }

    fn slot_index(&self, pbn: u64) -> usize {
        usize::try_from(pbn % self.slots.len() as u64).expect("slot index fits usize")
    }

    /// Marks `zone` as probing `pbn`. Must be paired with
    /// [`end_pending_search`](Self::end_pending_search).
    pub fn begin_pending_search(&self, pbn: u64, zone: u32) {
        self.searching[zone as usize].store(pbn + 1, Ordering::SeqCst);
    }

    pub fn end_pending_search(&self, zone: u32) {
        self.searching[zone as usize].store(0, Ordering::SeqCst);
    }

    /// Protected probe without parking: returns the page if resident.
    /// The caller decides whether a miss becomes a queued read.
    pub fn probe_protected(&self, pbn: u64, zone: u32) -> Option<Arc<CachedPage>> {
        self.begin_pending_search(pbn, zone);
        let found = self.lookup(pbn, zone);
        self.end_pending_search(zone);
        found
    }

    /// Lock-free fast path: returns the page if resident, otherwise
    /// parks `waiter` on the read queue.
    pub fn get_page_protected(&self, pbn: u64, zone: u32, waiter: ReadWaiter) -> ProtectedRead {
        self.begin_pending_search(pbn, zone);
        let found = self.lookup(pbn, zone);
        self.end_pending_search(zone);
        match found {
            Some(page) => ProtectedRead::Hit(page),
            None => {
                if self.enqueue_read(pbn, waiter) {
                    ProtectedRead::Queued
                } else {
                    ProtectedRead::QueueFull
                }
            }
        }
    }

    /// Synchronous lookup under the slot lock; used by paths that
    /// already own the page they are inserting or probing.
    pub fn get_page_locked(&self, pbn: u64, zone: u32) -> Option<Arc<CachedPage>> {
        self.lookup(pbn, zone)
    }

    fn lookup(&self, pbn: u64, zone: u32) -> Option<Arc<CachedPage>> {
        {
            let recent = self.recent[zone as usize].lock();
            if let Some(page) = recent.as_ref() {
                if page.pbn == pbn {
                    return Some(Arc::clone(page));
                }
            }
        }
        let slot = self.slots[self.slot_index(pbn)].lock();
        let page = slot.page.as_ref().filter(|p| p.pbn == pbn).cloned()?;
        drop(slot);
        *self.recent[zone as usize].lock() = Some(Arc::clone(&page));
        Some(page)
    }

    /// Parks a waiter for `pbn`, merging with an existing pending read.
    /// Returns `false` when the queue is at capacity.
    pub fn enqueue_read(&self, pbn: u64, waiter: ReadWaiter) -> bool {
        let mut pending = self.pending.lock();
        if let Some(waiters) = pending.waiters.get_mut(&pbn) {
            waiters.push(waiter);
            return true;
        }
        if pending.queue.len() >= VOLUME_CACHE_MAX_QUEUED_READS {
            trace!(pbn, "pending read queue full");
            return false;
        }
        pending.queue.push_back(pbn);
        pending.waiters.insert(pbn, vec![waiter]);
        drop(pending);
        self.reader_notify.notify_one();
        true
    }

    /// Takes the next pending read, if reader tasks are running.
    pub fn pop_pending_read(&self) -> Option<u64> {
        if self.read_threads_stopped.load(Ordering::Acquire) {
            return None;
        }
        self.pending.lock().queue.pop_front()
    }

    /// Installs a freshly read page and returns the waiters to restart.
    pub fn install_page(&self, pbn: u64, data: Vec<u8>) -> Vec<ReadWaiter> {
        let page = Arc::new(CachedPage { pbn, data });
        {
            let mut slot = self.slots[self.slot_index(pbn)].lock();
            slot.page = Some(Arc::clone(&page));
        }
        self.pending.lock().waiters.remove(&pbn).unwrap_or_default()
    }

    /// Abandons a failed read, handing back its waiters.
    pub fn abandon_read(&self, pbn: u64) -> Vec<ReadWaiter> {
        self.pending.lock().waiters.remove(&pbn).unwrap_or_default()
    }

    /// Removes `pbn` from the cache, then waits until no zone still has
    /// a pending search on it. Serialized with synchronous loads by the
    /// slot lock; the wait provides the cross-zone ordering guarantee.
    pub async fn invalidate_page(&self, pbn: u64) {
        {
            let mut slot = self.slots[self.slot_index(pbn)].lock();
            if slot.page.as_ref().is_some_and(|p| p.pbn == pbn) {
                slot.page = None;
            }
        }
        for recent in &self.recent {
            let mut recent = recent.lock();
            if recent.as_ref().is_some_and(|p| p.pbn == pbn) {
                *recent = None;
            }
        }
        self.wait_for_pending_searches(pbn).await;
    }

    async fn wait_for_pending_searches(&self, pbn: u64) {
        let marker = pbn + 1;
        loop {
            if !self.searching.iter().any(|s| s.load(Ordering::SeqCst) == marker) {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    /// Test latch: freezes reader tasks so the pending queue can be
    /// filled and inspected deterministically.
    pub fn stop_read_threads(&self) {
        self.read_threads_stopped.store(true, Ordering::Release);
    }

    pub fn restart_read_threads(&self) {
        self.read_threads_stopped.store(false, Ordering::Release);
        self.reader_notify.notify_waiters();
    }

    pub fn queued_read_count(&self) -> usize {
        self.pending.lock().queue.len()
    }

    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.reader_notify.notify_waiters();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub async fn reader_parked(&self) {
        self.reader_notify.notified().await;
    }
}
