//! The super-block codec.
//!
//! The super-block wraps the component states (recovery journal, slab
//! depot, block map, physical zones) in the shared checksummed envelope.
//! Version 12.0 is the current layout; version 67.0 is the prior one and
//! is still accepted on load, with its fields promoted into the current
//! structure so live upgrades never require a rewrite-first step.

use bytes::{Buf, BufMut};
use quarry_common::{Envelope, EnvelopeError};
use snafu::Snafu;

/// Envelope id of the super-block.
pub const SUPER_BLOCK_ID: u32 = 0;

/// Current format version.
pub const SUPER_BLOCK_MAJOR: u32 = 12;
pub const SUPER_BLOCK_MINOR: u32 = 0;

/// Prior format version, still readable.
pub const LEGACY_MAJOR: u32 = 67;
pub const LEGACY_MINOR: u32 = 0;

/// Error produced when decoding a super-block.
#[derive(Debug, Snafu)]
pub enum SuperBlockError {
    /// The envelope failed validation (checksum, truncation).
    #[snafu(display("super block envelope: {}", source))]
    Envelope { source: EnvelopeError },

    /// The version is neither current nor the supported legacy one.
    #[snafu(display("unsupported super block version {}.{}", major, minor))]
    UnsupportedVersion { major: u32, minor: u32 },

    /// The payload is shorter than its version requires.
    #[snafu(display("super block payload truncated: {} bytes", len))]
    ShortPayload { len: usize },
}

/// The component states carried by the super-block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ComponentStates {
    /// Sequence number the recovery journal resumes from.
    pub journal_start: u64,
    /// Logical blocks exposed upward.
    pub logical_blocks: u64,
    /// Physical blocks on the backing store.
    pub physical_blocks: u64,
    /// Volume nonce; detects accidental cross-volume reads.
    pub nonce: u64,
    /// Block-map tree roots.
    pub block_map_root_count: u8,
    /// Physical allocation zones.
    pub physical_zone_count: u8,
}

impl ComponentStates {
    /// Encodes the current (12.0) on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(34);
        payload.put_u64_le(self.nonce);
        payload.put_u64_le(self.logical_blocks);
        payload.put_u64_le(self.physical_blocks);
        payload.put_u64_le(self.journal_start);
        payload.put_u8(self.block_map_root_count);
        payload.put_u8(self.physical_zone_count);
        Envelope::new(SUPER_BLOCK_ID, SUPER_BLOCK_MAJOR, SUPER_BLOCK_MINOR, payload).encode()
    }

    /// Decodes a super-block, accepting the current and legacy
    /// versions.
    pub fn decode(bytes: &[u8]) -> Result<Self, SuperBlockError> {
        let envelope = Envelope::decode(bytes).map_err(|source| SuperBlockError::Envelope { source })?;
        match (envelope.major, envelope.minor) {
            (SUPER_BLOCK_MAJOR, SUPER_BLOCK_MINOR) => Self::decode_current(&envelope.payload),
            (LEGACY_MAJOR, LEGACY_MINOR) => Self::decode_legacy(&envelope.payload),
            (major, minor) => Err(SuperBlockError::UnsupportedVersion { major, minor }),
        }
    }

    fn decode_current(mut payload: &[u8]) -> Result<Self, SuperBlockError> {
        if payload.remaining() < 34 {
            return Err(SuperBlockError::ShortPayload { len: payload.len() });
        }
        Ok(ComponentStates {
            nonce: payload.get_u64_le(),
            logical_blocks: payload.get_u64_le(),
            physical_blocks: payload.get_u64_le(),
            journal_start: payload.get_u64_le(),
            block_map_root_count: payload.get_u8(),
            physical_zone_count: payload.get_u8(),
        })
    }

    /// The 67.0 layout ordered fields differently and spent a full u32
    /// on each count; promote them into the current structure.
    fn decode_legacy(mut payload: &[u8]) -> Result<Self, SuperBlockError> {
        if payload.remaining() < 8 * 4 + 4 + 4 {
            return Err(SuperBlockError::ShortPayload { len: payload.len() });
        }
        let logical_blocks = payload.get_u64_le();
        let physical_blocks = payload.get_u64_le();
        let journal_start = payload.get_u64_le();
        let nonce = payload.get_u64_le();
        let block_map_root_count = payload.get_u32_le();
        let physical_zone_count = payload.get_u32_le();
        Ok(ComponentStates {
            journal_start,
            logical_blocks,
            physical_blocks,
            nonce,
            block_map_root_count: u8::try_from(block_map_root_count).unwrap_or(u8::MAX),
            physical_zone_count: u8::try_from(physical_zone_count).unwrap_or(u8::MAX),
        })
    }

    /// Encodes the legacy (67.0) form; exists so upgrade paths can be
    /// tested against real bytes.
    pub fn encode_legacy(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(40);
        payload.put_u64_le(self.logical_blocks);
        payload.put_u64_le(self.physical_blocks);
        payload.put_u64_le(self.journal_start);
        payload.put_u64_le(self.nonce);
        payload.put_u32_le(u32::from(self.block_map_root_count));
        payload.put_u32_le(u32::from(self.physical_zone_count));
        Envelope::new(SUPER_BLOCK_ID, LEGACY_MAJOR, LEGACY_MINOR, payload).encode()
    }
}
