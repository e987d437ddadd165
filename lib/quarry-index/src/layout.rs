//! The index layout: where every region of the index lives on the
//! backing device.
//!
//! Relative to the configured base page (the byte offset divided by the
//! page size):
//!
//! ```text
//!   base + 0                config block: geometry + nonce
//!   base + 1                state block: open vcn, clean-save marker,
//!                           save image lengths
//!   base + 2 ..             save region: volume index image, then the
//!                           open chapter image, each page-aligned
//!   base + 2 + save_pages   chapter ring
//! ```
//!
//! The state block is written last on save, so a torn save leaves the
//! previous state marked dirty and the loader falls back to chapter
//! replay.

use std::io;
use std::sync::Arc;

use bytes::{Buf, BufMut};
use quarry_common::{Envelope, EnvelopeError};
use snafu::{ResultExt, Snafu};

use crate::geometry::Geometry;
use crate::volume::device::BlockDevice;

/// Envelope id of the config block.
const CONFIG_BLOCK_ID: u32 = 0x51494e58;

/// Envelope id of the state block.
const STATE_BLOCK_ID: u32 = 0x51535441;

/// Current layout version.
const LAYOUT_MAJOR: u32 = 1;
const LAYOUT_MINOR: u32 = 0;

/// Error produced by layout operations.
#[derive(Debug, Snafu)]
pub enum LayoutError {
    /// An I/O error from the backing device.
    #[snafu(display("layout I/O error: {}", source))]
    Io { source: io::Error },

    /// An on-disk block failed envelope validation.
    #[snafu(display("layout block invalid: {}", source))]
    BadBlock { source: EnvelopeError },

    /// A block decoded but did not describe what was expected.
    #[snafu(display("layout mismatch: {}", reason))]
    Mismatch { reason: String },

    /// A save image does not fit the reserved region.
    #[snafu(display("save image of {} bytes exceeds the {}-byte save region", needed, capacity))]
    SaveTooLarge { needed: u64, capacity: u64 },
}

/// State captured by a clean save, or the dirty marker left behind by a
/// running session.
#[derive(Clone, Debug, Default)]
pub struct SavedState {
    pub open_vcn: u64,
    pub clean: bool,
    pub volume_index_image: Vec<u8>,
    pub open_chapter_image: Vec<u8>,
}

/// The region map of one index on one device.
pub struct IndexLayout {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    nonce: u64,
    base_page: u64,
    save_pages: u64,
}

impl IndexLayout {
    /// Formats a fresh layout: config block plus a dirty state block.
    pub async fn format(
        device: Arc<dyn BlockDevice>,
        geometry: &Geometry,
        nonce: u64,
        base_page: u64,
    ) -> Result<Self, LayoutError> {
        let layout = IndexLayout {
            device,
            geometry: geometry.clone(),
            nonce,
            base_page,
            save_pages: save_region_pages(geometry),
        };
        layout.write_config().await?;
        layout.write_state_block(&SavedState::default()).await?;
        layout.device.flush().await.context(IoSnafu)?;
        Ok(layout)
    }

    /// Loads an existing layout, reconstructing the geometry and nonce
    /// from the config block.
    pub async fn load(device: Arc<dyn BlockDevice>, base_page: u64) -> Result<Self, LayoutError> {
        let page_size = device.page_size();
        let mut buf = vec![0u8; page_size];
        device.read_page(base_page, &mut buf).await.context(IoSnafu)?;
        let envelope = Envelope::decode(&buf).context(BadBlockSnafu)?;
        if envelope.id != CONFIG_BLOCK_ID {
            return Err(LayoutError::Mismatch {
                reason: format!("config block id {:08x}", envelope.id),
            });
        }
        if envelope.major != LAYOUT_MAJOR {
            return Err(LayoutError::Mismatch {
                reason: format!("layout version {}.{}", envelope.major, envelope.minor),
            });
        }
        let (geometry, nonce) = decode_config(&envelope.payload)?;
        if geometry.bytes_per_page != page_size {
            return Err(LayoutError::Mismatch {
                reason: format!(
                    "geometry page size {} vs device page size {}",
                    geometry.bytes_per_page, page_size
                ),
            });
        }
        let save_pages = save_region_pages(&geometry);
        Ok(IndexLayout {
            device,
            geometry,
            nonce,
            base_page,
            save_pages,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn base_page(&self) -> u64 {
        self.base_page
    }

    /// First page of the chapter ring.
    pub fn ring_base(&self) -> u64 {
        self.base_page + 2 + self.save_pages
    }

    /// Total pages the layout occupies on the device.
    pub fn total_pages(&self) -> u64 {
        2 + self.save_pages
            + u64::from(self.geometry.pages_per_chapter())
                * u64::from(self.geometry.chapters_per_volume)
    }

    /// Persists a save image. The images land first, the state block
    /// last as the commit point.
    pub async fn save_state(&self, state: &SavedState) -> Result<(), LayoutError> {
        let vi_pages = pages_for(state.volume_index_image.len(), self.geometry.bytes_per_page);
        let oc_pages = pages_for(state.open_chapter_image.len(), self.geometry.bytes_per_page);
        let needed = (vi_pages + oc_pages) * self.geometry.bytes_per_page as u64;
        let capacity = self.save_pages * self.geometry.bytes_per_page as u64;
        if vi_pages + oc_pages > self.save_pages {
            return Err(LayoutError::SaveTooLarge { needed, capacity });
        }

        let save_base = self.base_page + 2;
        self.write_blob(save_base, &state.volume_index_image).await?;
        self.write_blob(save_base + vi_pages, &state.open_chapter_image).await?;
        self.write_state_block(state).await?;
        self.device.flush().await.context(IoSnafu)?;
        debug!(
            open_vcn = state.open_vcn,
            clean = state.clean,
            vi_bytes = state.volume_index_image.len(),
            oc_bytes = state.open_chapter_image.len(),
            "saved index state"
        );
        Ok(())
    }

    /// Reads back the state block and any save images it describes.
    pub async fn load_state(&self) -> Result<SavedState, LayoutError> {
        let mut buf = vec![0u8; self.geometry.bytes_per_page];
        self.device
            .read_page(self.base_page + 1, &mut buf)
            .await
            .context(IoSnafu)?;
        let envelope = Envelope::decode(&buf).context(BadBlockSnafu)?;
        if envelope.id != STATE_BLOCK_ID {
            return Err(LayoutError::Mismatch {
                reason: format!("state block id {:08x}", envelope.id),
            });
        }
        let mut payload = envelope.payload.as_slice();
        if payload.remaining() < 8 + 1 + 8 + 8 + 8 {
            return Err(LayoutError::Mismatch {
                reason: "state block too short".to_string(),
            });
        }
        let open_vcn = payload.get_u64_le();
        let clean = payload.get_u8() != 0;
        let stored_nonce = payload.get_u64_le();
        let vi_len = usize::try_from(payload.get_u64_le()).expect("length fits usize");
        let oc_len = usize::try_from(payload.get_u64_le()).expect("length fits usize");
        if stored_nonce != self.nonce {
            return Err(LayoutError::Mismatch {
                reason: format!("state nonce {stored_nonce:016x} vs {:016x}", self.nonce),
            });
        }

        let mut state = SavedState {
            open_vcn,
            clean,
            ..SavedState::default()
        };
        if clean {
            let save_base = self.base_page + 2;
            let vi_pages = pages_for(vi_len, self.geometry.bytes_per_page);
            state.volume_index_image = self.read_blob(save_base, vi_len).await?;
            state.open_chapter_image = self.read_blob(save_base + vi_pages, oc_len).await?;
        }
        Ok(state)
    }

    /// Marks the on-disk state dirty; called as soon as a loaded session
    /// starts mutating, so a crash forces replay instead of trusting a
    /// stale image.
    pub async fn mark_dirty(&self, open_vcn: u64) -> Result<(), LayoutError> {
        let state = SavedState {
            open_vcn,
            clean: false,
            ..SavedState::default()
        };
        self.write_state_block(&state).await?;
        self.device.flush().await.context(IoSnafu)
    }

    async fn write_config(&self) -> Result<(), LayoutError> {
        let mut payload = Vec::new();
        encode_config(&self.geometry, self.nonce, &mut payload);
        let envelope = Envelope::new(CONFIG_BLOCK_ID, LAYOUT_MAJOR, LAYOUT_MINOR, payload);
        self.write_envelope(self.base_page, &envelope).await
    }

    async fn write_state_block(&self, state: &SavedState) -> Result<(), LayoutError> {
        let mut payload = Vec::new();
        payload.put_u64_le(state.open_vcn);
        payload.put_u8(u8::from(state.clean));
        payload.put_u64_le(self.nonce);
        payload.put_u64_le(state.volume_index_image.len() as u64);
        payload.put_u64_le(state.open_chapter_image.len() as u64);
        let envelope = Envelope::new(STATE_BLOCK_ID, LAYOUT_MAJOR, LAYOUT_MINOR, payload);
        self.write_envelope(self.base_page + 1, &envelope).await
    }

    async fn write_envelope(&self, page: u64, envelope: &Envelope) -> Result<(), LayoutError> {
        let mut buf = envelope.encode();
        assert!(buf.len() <= self.geometry.bytes_per_page, "envelope fits one page");
        buf.resize(self.geometry.bytes_per_page, 0);
        self.device.write_page(page, &buf).await.context(IoSnafu)
    }

    async fn write_blob(&self, start_page: u64, bytes: &[u8]) -> Result<(), LayoutError> {
        let page_size = self.geometry.bytes_per_page;
        for (i, chunk) in bytes.chunks(page_size).enumerate() {
            let mut buf = vec![0u8; page_size];
            buf[..chunk.len()].copy_from_slice(chunk);
            self.device
                .write_page(start_page + i as u64, &buf)
                .await
                .context(IoSnafu)?;
        }
        Ok(())
    }

    async fn read_blob(&self, start_page: u64, len: usize) -> Result<Vec<u8>, LayoutError> {
        let page_size = self.geometry.bytes_per_page;
        let mut bytes = Vec::with_capacity(len);
        let mut page = start_page;
        while bytes.len() < len {
            let mut buf = vec![0u8; page_size];
            self.device.read_page(page, &mut buf).await.context(IoSnafu)?;
            let take = (len - bytes.len()).min(page_size);
            bytes.extend_from_slice(&buf[..take]);
            page += 1;
        }
        Ok(bytes)
    }
}

fn pages_for(bytes: usize, page_size: usize) -> u64 {
    (bytes as u64).div_ceil(page_size as u64)
}

/// Pages reserved for save images: a generous per-record byte budget for
/// the volume index plus the full open chapter.
fn save_region_pages(geometry: &Geometry) -> u64 {
    let volume_index_bytes = geometry.records_per_volume() * 8 + 4096;
    let open_chapter_bytes = u64::from(geometry.records_per_chapter()) * 32 + 64;
    (volume_index_bytes + open_chapter_bytes).div_ceil(geometry.bytes_per_page as u64) + 1
}

fn encode_config(geometry: &Geometry, nonce: u64, out: &mut Vec<u8>) {
    out.put_u64_le(nonce);
    out.put_u32_le(geometry.bytes_per_page as u32);
    out.put_u32_le(geometry.records_per_page);
    out.put_u32_le(geometry.record_pages_per_chapter);
    out.put_u32_le(geometry.index_pages_per_chapter);
    out.put_u32_le(geometry.chapters_per_volume);
    out.put_u32_le(geometry.delta_lists_per_chapter);
    out.put_u32_le(geometry.chapter_address_bits);
    out.put_u32_le(geometry.chapter_payload_bits);
    out.put_u32_le(geometry.volume_index_delta_lists);
    out.put_u32_le(geometry.volume_index_address_bits);
    out.put_u32_le(geometry.volume_index_payload_bits);
    out.put_u32_le(geometry.sparse_chapters_per_volume);
    out.put_u32_le(geometry.sparse_sample_rate);
}

fn decode_config(mut input: &[u8]) -> Result<(Geometry, u64), LayoutError> {
    if input.remaining() < 8 + 13 * 4 {
        return Err(LayoutError::Mismatch {
            reason: "config block too short".to_string(),
        });
    }
    let nonce = input.get_u64_le();
    let geometry = Geometry {
        bytes_per_page: input.get_u32_le() as usize,
        records_per_page: input.get_u32_le(),
        record_pages_per_chapter: input.get_u32_le(),
        index_pages_per_chapter: input.get_u32_le(),
        chapters_per_volume: input.get_u32_le(),
        delta_lists_per_chapter: input.get_u32_le(),
        chapter_address_bits: input.get_u32_le(),
        chapter_payload_bits: input.get_u32_le(),
        volume_index_delta_lists: input.get_u32_le(),
        volume_index_address_bits: input.get_u32_le(),
        volume_index_payload_bits: input.get_u32_le(),
        sparse_chapters_per_volume: input.get_u32_le(),
        sparse_sample_rate: input.get_u32_le(),
    };
    Ok((geometry, nonce))
}
