//! The data_vio pool: bounded per-request contexts with discard
//! admission control.
//!
//! Two limiters share one preallocated pool: the general limiter covers
//! every request, the discard limiter additionally gates discards so a
//! flood of them cannot starve ordinary I/O. Waiters are stamped with
//! their arrival time; a freed context always goes to the oldest
//! eligible waiter across both limiters.
//!
//! Releases are batched: `release` pushes onto a lock-free queue and at
//! most one processor task (guarded by a compare-and-swap on the
//! `processing` flag) drains it in bounded batches, waking served
//! waiters only after each batch completes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;
use quarry_common::BLOCK_SIZE;
use tokio::sync::oneshot;

/// Releases processed per batch.
pub const RELEASE_BATCH_SIZE: usize = 128;

/// Default share of the pool a discard flood may hold.
pub const DEFAULT_DISCARD_FRACTION: (u32, u32) = (3, 4);

/// Diagnostic dump chunking, to keep log bursts bounded.
const DUMP_CHUNK: usize = 35;
const DUMP_PAUSE: Duration = Duration::from_millis(4);

/// One preallocated request context.
pub struct DataVio {
    pub id: u32,
    /// The 4 KiB data buffer.
    pub data: Vec<u8>,
    /// Scratch for a compressed block.
    pub scratch: Vec<u8>,
    pub lbn: Option<u64>,
    pub is_discard: bool,
    /// Bio arrival time, stamped at acquisition.
    pub arrival: Instant,
}

impl DataVio {
    fn new(id: u32) -> Self {
        DataVio {
            id,
            data: vec![0u8; BLOCK_SIZE],
            scratch: vec![0u8; BLOCK_SIZE],
            lbn: None,
            is_discard: false,
            arrival: Instant::now(),
        }
    }

    fn reset(&mut self, arrival: Instant, is_discard: bool) {
        self.lbn = None;
        self.is_discard = is_discard;
        self.arrival = arrival;
    }
}

struct Waiter {
    arrival: Instant,
    is_discard: bool,
    /// Set when a released discard's permit was transferred to this
    /// waiter ahead of a context becoming available.
    has_permit: bool,
    tx: oneshot::Sender<Box<DataVio>>,
}

struct Limiter {
    busy: u32,
    limit: u32,
    max_busy: u32,
    waiters: VecDeque<Waiter>,
}

impl Limiter {
    fn new(limit: u32) -> Self {
        Limiter {
            busy: 0,
            limit,
            max_busy: 0,
            waiters: VecDeque::new(),
        }
    }

    fn take(&mut self) {
        self.busy += 1;
        self.max_busy = self.max_busy.max(self.busy);
    }
}

struct PoolState {
    available: Vec<Box<DataVio>>,
    general: Limiter,
    discard: Limiter,
}

/// Point-in-time pool statistics. Max-busy values are monotone.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    pub pool_size: u32,
    pub discard_limit: u32,
    pub busy: u32,
    pub discard_busy: u32,
    pub max_busy: u32,
    pub max_discard_busy: u32,
    pub waiting: u32,
    pub discard_waiting: u32,
}

/// The bounded pool.
pub struct DataVioPool {
    state: Mutex<PoolState>,
    releases: SegQueue<Box<DataVio>>,
    processing: AtomicBool,
}

impl DataVioPool {
    /// Builds a pool of `pool_size` contexts with `discard_limit`
    /// discard permits (clamped to three quarters of the pool when
    /// zero or oversized).
    pub fn new(pool_size: u32, discard_limit: u32) -> Arc<Self> {
        assert!(pool_size > 0);
        let (num, den) = DEFAULT_DISCARD_FRACTION;
        let default_limit = (pool_size * num / den).max(1);
        let discard_limit = if discard_limit == 0 {
            default_limit
        } else {
            discard_limit.min(default_limit)
        };
        let available = (0..pool_size).map(|id| Box::new(DataVio::new(id))).collect();
        Arc::new(DataVioPool {
            state: Mutex::new(PoolState {
                available,
                general: Limiter::new(pool_size),
                discard: Limiter::new(discard_limit),
            }),
            releases: SegQueue::new(),
            processing: AtomicBool::new(false),
        })
    }

    /// Acquires a context, waiting FIFO within the limiter when the
    /// pool (or the discard allowance) is exhausted.
    pub async fn acquire(self: &Arc<Self>, is_discard: bool) -> Box<DataVio> {
        let arrival = Instant::now();
        let rx = {
            let mut state = self.state.lock();
            let discard_ok = !is_discard || state.discard.busy < state.discard.limit;
            if discard_ok && state.general.busy < state.general.limit && !state.available.is_empty()
            {
                let mut vio = state.available.pop().expect("checked non-empty");
                state.general.take();
                if is_discard {
                    state.discard.take();
                }
                vio.reset(arrival, is_discard);
                return vio;
            }
            let (tx, rx) = oneshot::channel();
            let waiter = Waiter {
                arrival,
                is_discard,
                has_permit: false,
                tx,
            };
            if is_discard && state.discard.busy >= state.discard.limit {
                state.discard.waiters.push_back(waiter);
            } else {
                state.general.waiters.push_back(waiter);
            }
            rx
        };
        rx.await.expect("pool outlives waiters")
    }

    /// Returns a context to the pool. Lock-free: the context lands on
    /// the release queue and at most one processor drains it.
    pub fn release(self: &Arc<Self>, vio: Box<DataVio>) {
        self.releases.push(vio);
        if !self.processing.swap(true, Ordering::AcqRel) {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                pool.process_releases();
            });
        }
    }

    fn process_releases(self: &Arc<Self>) {
        loop {
            let mut served: Vec<(oneshot::Sender<Box<DataVio>>, Box<DataVio>)> = Vec::new();
            {
                let mut state = self.state.lock();
                for _ in 0..RELEASE_BATCH_SIZE {
                    let Some(vio) = self.releases.pop() else {
                        break;
                    };
                    retire(&mut state, vio, &mut served);
                }
            }
            // Wake only after the batch's bookkeeping is settled.
            for (tx, vio) in served {
                let _ = tx.send(vio);
            }
            if self.releases.is_empty() {
                self.processing.store(false, Ordering::Release);
                if self.releases.is_empty() {
                    return;
                }
                if self.processing.swap(true, Ordering::AcqRel) {
                    return;
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            pool_size: state.general.limit,
            discard_limit: state.discard.limit,
            busy: state.general.busy,
            discard_busy: state.discard.busy,
            max_busy: state.general.max_busy,
            max_discard_busy: state.discard.max_busy,
            waiting: state.general.waiters.len() as u32,
            discard_waiting: state.discard.waiters.len() as u32,
        }
    }

    /// Writes a throttled diagnostic dump of the pool, chunked so a
    /// stuck system does not overrun the log.
    pub async fn dump(&self) {
        let (stats, ages) = {
            let state = self.state.lock();
            let ages: Vec<(bool, Duration)> = state
                .general
                .waiters
                .iter()
                .chain(state.discard.waiters.iter())
                .map(|w| (w.is_discard, w.arrival.elapsed()))
                .collect();
            (self.stats(), ages)
        };
        info!(
            busy = stats.busy,
            discard_busy = stats.discard_busy,
            max_busy = stats.max_busy,
            waiting = stats.waiting,
            discard_waiting = stats.discard_waiting,
            "data_vio pool"
        );
        for chunk in ages.chunks(DUMP_CHUNK) {
            for (is_discard, age) in chunk {
                info!(discard = is_discard, age_ms = age.as_millis() as u64, "waiter");
            }
            tokio::time::sleep(DUMP_PAUSE).await;
        }
    }
}

/// Retires one released context: permits move first, then the context
/// goes to the oldest eligible waiter or back to the free list.
fn retire(
    state: &mut PoolState,
    mut vio: Box<DataVio>,
    served: &mut Vec<(oneshot::Sender<Box<DataVio>>, Box<DataVio>)>,
) {
    debug_assert!(state.general.busy > 0);
    state.general.busy -= 1;
    if vio.is_discard {
        // Hand the permit to the eldest discard waiter instead of
        // releasing it, if one is parked.
        match state.discard.waiters.front_mut() {
            Some(waiter) if !waiter.has_permit => waiter.has_permit = true,
            _ => {
                debug_assert!(state.discard.busy > 0);
                state.discard.busy -= 1;
            }
        }
    }

    // Oldest eligible waiter across both limiters wins the context.
    let discard_eligible = state
        .discard
        .waiters
        .front()
        .is_some_and(|w| w.has_permit || state.discard.busy < state.discard.limit);
    let general_arrival = state.general.waiters.front().map(|w| w.arrival);
    let discard_arrival = if discard_eligible {
        state.discard.waiters.front().map(|w| w.arrival)
    } else {
        None
    };

    let waiter = match (general_arrival, discard_arrival) {
        (Some(g), Some(d)) if d < g => state.discard.waiters.pop_front(),
        (_, None) => state.general.waiters.pop_front(),
        (None, Some(_)) => state.discard.waiters.pop_front(),
        (Some(_), Some(_)) => state.general.waiters.pop_front(),
    };

    match waiter {
        Some(waiter) => {
            state.general.take();
            if waiter.is_discard && !waiter.has_permit {
                state.discard.take();
            } else if waiter.is_discard {
                // Transferred permit: busy count unchanged, but the
                // high-water mark still reflects the handoff.
                state.discard.max_busy = state.discard.max_busy.max(state.discard.busy);
            }
            vio.reset(waiter.arrival, waiter.is_discard);
            served.push((waiter.tx, vio));
        }
        None => state.available.push(vio),
    }
}
