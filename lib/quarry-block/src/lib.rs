//! # Quarry block layer
//!
//! The logical-to-physical half of the system: a four-level block map
//! from logical block numbers to physical block numbers, a bounded pool
//! of per-request contexts with discard admission control, and an
//! era-based dirty-page writeback engine keyed by recovery-journal
//! sequence numbers.
//!
//! The recovery journal and the slab allocator are external
//! collaborators: this crate defines their interfaces ([`journal`],
//! [`slab`]) and ships in-memory doubles for tests and embedders, but
//! their durable implementations live elsewhere.
//!
//! ## Failure model
//!
//! Any metadata I/O error or logic violation inside a zone latches the
//! whole layer read-only: subsequent writes fail fast with `ReadOnly`
//! while reads of unaffected regions continue. Reference-count
//! underflow and writing a page that is not on a dirty list are logic
//! violations.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod data_vio;
pub mod entry;
pub mod era;
pub mod forest;
pub mod journal;
pub mod logical;
pub mod page;
pub mod read_only;
pub mod slab;
pub mod store;
pub mod super_block;

pub use data_vio::{DataVio, DataVioPool, PoolStats};
pub use entry::{BlockMapEntry, BlockMapState, BLOCK_MAP_ENTRIES_PER_PAGE};
pub use forest::Forest;
pub use logical::BlockLayer;
pub use read_only::ReadOnlyNotifier;
pub use super_block::ComponentStates;
