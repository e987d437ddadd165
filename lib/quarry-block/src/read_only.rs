//! The read-only latch.
//!
//! Any metadata I/O failure or logic violation flips the layer into
//! read-only mode. The latch is sticky for the life of the process;
//! recovery happens through rebuild tooling, not at runtime.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

/// Sticky read-only latch shared across zones.
#[derive(Default)]
pub struct ReadOnlyNotifier {
    read_only: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl ReadOnlyNotifier {
    pub fn new() -> Self {
        ReadOnlyNotifier::default()
    }

    /// Latches read-only mode, keeping the first reason.
    pub fn enter_read_only(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if !self.read_only.swap(true, Ordering::SeqCst) {
            error!(%reason, "entering read-only mode");
            *self.reason.lock() = Some(reason);
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
