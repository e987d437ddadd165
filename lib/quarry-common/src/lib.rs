//! Shared vocabulary for the quarry storage core.
//!
//! This crate holds the small set of types that both halves of the system
//! (the dedup index in `quarry-index`, the block layer in `quarry-block`)
//! need to agree on: the wire-level status codes reported to callers, and
//! a handful of fixed widths for on-disk addressing.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod envelope;
mod status;

pub use envelope::{Envelope, EnvelopeError};
pub use status::Status;

/// Size, in bytes, of a data block. Both subsystems address storage in
/// these units.
pub const BLOCK_SIZE: usize = 4096;

/// Logical block number on the user-visible address space.
pub type LogicalBlockNumber = u64;

/// Physical block number on the backing device.
pub type PhysicalBlockNumber = u64;

/// Monotonically increasing chapter identifier. The physical chapter slot
/// is `vcn % chapters_per_volume`.
pub type VirtualChapterNumber = u64;

/// Recovery-journal sequence number, advertised by the journal and used to
/// key dirty-page eras in the block map.
pub type SequenceNumber = u64;
