//! Page-granular metadata storage under the block map.
//!
//! Mirrors the index side's device seam so the forest can persist tree
//! pages without knowing what it is sitting on. The in-memory store is
//! the test double; it can optionally drop writes to exercise
//! reformat-on-load paths.

use std::collections::HashMap;
use std::io;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::page::BLOCK_MAP_PAGE_BYTES;

/// Storage for block-map tree pages, addressed by PBN.
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Reads one page; never-written pages read as zeroes.
    async fn read_page(&self, pbn: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes one page.
    async fn write_page(&self, pbn: u64, data: &[u8]) -> io::Result<()>;

    /// Forces written pages to durable storage.
    async fn flush(&self) -> io::Result<()>;
}

/// RAM-backed page store.
#[derive(Default)]
pub struct MemoryStore {
    pages: Mutex<HashMap<u64, Vec<u8>>>,
    #[cfg(test)]
    drop_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Test hook: silently discard subsequent writes, simulating a
    /// device that acknowledges but never persists.
    #[cfg(test)]
    pub fn set_drop_writes(&self, drop: bool) {
        self.drop_writes
            .store(drop, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl PageStore for MemoryStore {
    async fn read_page(&self, pbn: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), BLOCK_MAP_PAGE_BYTES);
        match self.pages.lock().get(&pbn) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    async fn write_page(&self, pbn: u64, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len(), BLOCK_MAP_PAGE_BYTES);
        #[cfg(test)]
        if self.drop_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        self.pages.lock().insert(pbn, data.to_vec());
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}
