//! # Quarry
//!
//! A block-level deduplicating storage core built from two tightly
//! coupled subsystems:
//!
//! - **`quarry-index`** is a content-addressed deduplication index: a
//!   fixed-capacity associative cache from 16-byte record names to
//!   16-byte metadata, organized as a ring of chapters with a
//!   RAM-resident volume index, crash recovery by chapter replay, and
//!   optional sparse (sampled) indexing.
//! - **`quarry-block`** is a logical-to-physical block mapper: a
//!   four-level block-map forest, a bounded pool of request contexts
//!   with discard admission control, and era-based dirty-page writeback
//!   driven by recovery-journal sequence numbers.
//!
//! This crate is the assembly point: configuration that derives an
//! index geometry and block-layer shape from a handful of user-facing
//! knobs, and re-exports of the surfaces embedders program against.
//! The recovery journal and slab depot remain external collaborators;
//! wire in real implementations through the [`quarry_block::journal`]
//! and [`quarry_block::slab`] traits.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;

pub use config::{BlockConfig, ConfigError, IndexConfigBuilder};
pub use quarry_common::Status;
pub use quarry_index::{
    BlockDevice, FileDevice, Geometry, IndexSession, MemorySize, OpenMode, RecordMetadata,
    RecordName, Request, RequestKind, Response, SessionParams, SessionStats,
};

pub use quarry_block::{
    BlockLayer, BlockMapEntry, BlockMapState, ComponentStates, DataVioPool, Forest,
    ReadOnlyNotifier,
};
