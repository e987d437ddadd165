//! Shared fixtures: miniature geometries and record constructors.

use std::sync::Arc;

use quarry_index::name::{RecordMetadata, RecordName};
use quarry_index::volume::device::MemoryDevice;
use quarry_index::{Geometry, IndexSession, OpenMode, SessionParams};

/// A miniature dense geometry: 64-record chapters, a 16-chapter ring,
/// 512-byte pages. Small enough that tests wrap the volume in seconds.
pub fn tiny_geometry() -> Geometry {
    Geometry {
        bytes_per_page: 512,
        records_per_page: 16,
        record_pages_per_chapter: 4,
        index_pages_per_chapter: 2,
        chapters_per_volume: 16,
        delta_lists_per_chapter: 8,
        chapter_address_bits: 16,
        chapter_payload_bits: 2,
        volume_index_delta_lists: 64,
        volume_index_address_bits: 20,
        volume_index_payload_bits: 5,
        sparse_chapters_per_volume: 0,
        sparse_sample_rate: 1,
    }
}

/// A wider ring (128 chapters of 256 records) for collision-flood
/// tests: the volume index must absorb thousands of full-name collision
/// entries without exhausting its buffer.
pub fn biased_geometry() -> Geometry {
    Geometry {
        bytes_per_page: 512,
        records_per_page: 16,
        record_pages_per_chapter: 16,
        index_pages_per_chapter: 4,
        chapters_per_volume: 128,
        delta_lists_per_chapter: 32,
        chapter_address_bits: 16,
        chapter_payload_bits: 4,
        volume_index_delta_lists: 256,
        volume_index_address_bits: 20,
        volume_index_payload_bits: 8,
        sparse_chapters_per_volume: 0,
        sparse_sample_rate: 1,
    }
}

pub fn name_of(i: u32) -> RecordName {
    RecordName::from_content(&i.to_le_bytes())
}

pub fn meta_of(i: u32) -> RecordMetadata {
    let mut m = [0u8; 16];
    m[..4].copy_from_slice(&i.to_le_bytes());
    m
}

pub fn memory_device(geometry: &Geometry) -> Arc<MemoryDevice> {
    Arc::new(MemoryDevice::new(geometry.bytes_per_page))
}

pub async fn open_session(
    geometry: Geometry,
    device: Arc<MemoryDevice>,
    mode: OpenMode,
) -> IndexSession {
    let mut params = SessionParams::new(geometry, 0x5152_5900);
    params.zone_count = 2;
    IndexSession::open(params, device as _, mode)
        .await
        .expect("session opens")
}
