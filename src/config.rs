//! User-facing configuration, reduced to the knobs that matter.
//!
//! The index side is configured by a memory-size tier plus a handful of
//! switches; everything else derives from the geometry. The block side
//! takes explicit shape numbers because they come from the volume
//! format, not from tuning.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use quarry_index::geometry::GeometryError;
use quarry_index::{BlockDevice, Geometry, IndexSession, MemorySize, OpenMode, SessionParams};

/// Error produced while building a configuration.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// The memory tier cannot be realized.
    #[snafu(display("invalid geometry: {}", source))]
    Geometry { source: GeometryError },

    /// A parameter combination is rejected.
    #[snafu(display("invalid parameter: {}", reason))]
    Invalid { reason: String },
}

/// Builder for an index session configuration.
///
/// ```no_run
/// # use quarry::{IndexConfigBuilder, MemorySize};
/// # fn main() -> Result<(), quarry::ConfigError> {
/// let params = IndexConfigBuilder::new(MemorySize::Gb(1))
///     .sparse(true)
///     .nonce(0x1234_5678)
///     .zone_count(4)
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct IndexConfigBuilder {
    memory_size: MemorySize,
    reduced: bool,
    sparse: bool,
    nonce: u64,
    /// Bytes to skip on the backing device, for LVM headroom.
    offset: u64,
    /// Zero selects the default: half the CPUs, at least one.
    zone_count: u32,
}

impl IndexConfigBuilder {
    pub fn new(memory_size: MemorySize) -> Self {
        IndexConfigBuilder {
            memory_size,
            reduced: false,
            sparse: false,
            nonce: 0,
            offset: 0,
            zone_count: 0,
        }
    }

    /// Selects the reduced sibling geometry (one fewer chapter), as
    /// produced by an LVM conversion.
    pub fn reduced(mut self, reduced: bool) -> Self {
        self.reduced = reduced;
        self
    }

    pub fn sparse(mut self, sparse: bool) -> Self {
        self.sparse = sparse;
        self
    }

    pub fn nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn zone_count(mut self, zone_count: u32) -> Self {
        self.zone_count = zone_count;
        self
    }

    /// Derives the geometry and produces session parameters.
    pub fn build(self) -> Result<SessionParams, ConfigError> {
        let geometry = Geometry::derive(self.memory_size, self.reduced, self.sparse)
            .context(GeometrySnafu)?;
        if self.offset % geometry.bytes_per_page as u64 != 0 {
            return Err(ConfigError::Invalid {
                reason: format!("offset {} is not page aligned", self.offset),
            });
        }
        let mut params = SessionParams::new(geometry, self.nonce);
        params.offset_bytes = self.offset;
        params.zone_count = self.zone_count;
        Ok(params)
    }

    /// Builds and opens the session in one step.
    pub async fn open(
        self,
        device: Arc<dyn BlockDevice>,
        mode: OpenMode,
    ) -> Result<IndexSession, ConfigError> {
        let params = self.build()?;
        IndexSession::open(params, device, mode)
            .await
            .map_err(|e| ConfigError::Invalid {
                reason: e.to_string(),
            })
    }
}

/// Shape of the block layer, dictated by the volume format.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct BlockConfig {
    pub nonce: u64,
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    pub block_map_root_count: u8,
    pub physical_zone_count: u8,
    /// Preallocated request contexts.
    pub data_vio_pool_size: u32,
    /// Discard permits; zero selects three quarters of the pool.
    pub discard_limit: u32,
    /// Journal sequences per writeback era.
    pub era_period: u64,
}

impl Default for BlockConfig {
    fn default() -> Self {
        BlockConfig {
            nonce: 0,
            logical_blocks: 1 << 20,
            physical_blocks: 1 << 20,
            block_map_root_count: 16,
            physical_zone_count: 1,
            data_vio_pool_size: 2048,
            discard_limit: 0,
            era_period: 4096,
        }
    }
}
