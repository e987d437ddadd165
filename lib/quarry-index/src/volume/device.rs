//! Generalized interface for page-granular block storage.
//!
//! The index parameterizes all of its I/O over [`BlockDevice`] so tests
//! can run against in-memory devices and the production path can sit on
//! a real file or block device.

use std::collections::HashMap;
use std::io::{self, SeekFrom};
use std::path::Path;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Page-granular storage under the volume.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Reads one page into `buf`. Reading a page that was never written
    /// yields zeroes.
    async fn read_page(&self, page: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes one page.
    async fn write_page(&self, page: u64, data: &[u8]) -> io::Result<()>;

    /// Forces written pages to durable storage.
    async fn flush(&self) -> io::Result<()>;

    /// Size of one page, in bytes.
    fn page_size(&self) -> usize;
}

/// A file-backed device.
///
/// Uses one seekable handle behind an async mutex; the volume's page
/// cache keeps the hot path away from this lock.
pub struct FileDevice {
    file: Mutex<tokio::fs::File>,
    page_size: usize,
}

impl FileDevice {
    /// Opens (creating if missing) a file-backed device.
    pub async fn open<P: AsRef<Path>>(path: P, page_size: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        Ok(FileDevice {
            file: Mutex::new(file),
            page_size,
        })
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    async fn read_page(&self, page: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut file = self.file.lock().await;
        let len = file.metadata().await?.len();
        let offset = page * self.page_size as u64;
        if offset >= len {
            buf.fill(0);
            return Ok(());
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let available = usize::try_from((len - offset).min(self.page_size as u64))
            .expect("page size fits usize");
        file.read_exact(&mut buf[..available]).await?;
        buf[available..].fill(0);
        Ok(())
    }

    async fn write_page(&self, page: u64, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(page * self.page_size as u64)).await?;
        file.write_all(data).await?;
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        let file = self.file.lock().await;
        file.sync_all().await
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

/// A RAM-backed device for tests and embedders that want a throwaway
/// volume.
pub struct MemoryDevice {
    pages: SyncMutex<HashMap<u64, Vec<u8>>>,
    page_size: usize,
}

impl MemoryDevice {
    pub fn new(page_size: usize) -> Self {
        MemoryDevice {
            pages: SyncMutex::new(HashMap::new()),
            page_size,
        }
    }

    /// Byte-copies the device, as a block-level clone would.
    pub fn snapshot(&self) -> MemoryDevice {
        MemoryDevice {
            pages: SyncMutex::new(self.pages.lock().clone()),
            page_size: self.page_size,
        }
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    async fn read_page(&self, page: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        match self.pages.lock().get(&page) {
            Some(data) => buf.copy_from_slice(data),
            None => buf.fill(0),
        }
        Ok(())
    }

    async fn write_page(&self, page: u64, data: &[u8]) -> io::Result<()> {
        debug_assert_eq!(data.len(), self.page_size);
        self.pages.lock().insert(page, data.to_vec());
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}
