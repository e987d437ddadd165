//! # Quarry dedup index
//!
//! A fixed-capacity, content-addressed deduplication index. Callers hand
//! in 4 KiB blocks (or pre-hashed 16-byte record names) together with 16
//! bytes of opaque metadata; the index answers "have I seen this content
//! before, and what metadata was stored with it?"
//!
//! ## Design constraints
//!
//! These invariants keep the design understandable and the memory
//! footprint fixed:
//! - the index never allocates per-record heap objects; all record state
//!   lives in bit-packed delta lists or fixed page buffers
//! - a record's name is 16 bytes of cryptographic-strength hash output;
//!   names are never compared as strings, only as packed integer fields
//! - chapters are the unit of batching, aging, and recovery: records are
//!   collected in the open chapter, written as one physical chapter, and
//!   forgotten when the chapter slot is reused a full volume later
//! - the RAM-resident volume index answers "which chapter" only; the
//!   on-disk chapter index answers "which record page" within a chapter
//! - every multi-byte integer is explicit about its endianness: record
//!   name fields and chapter headers are big-endian, everything the
//!   super-block codec touches is little-endian
//!
//! ## Request flow
//!
//! A request is hashed, routed to the zone owning its name, checked
//! against the open chapter, then the volume index, and finally (on a
//! chapter hit) the chapter's index pages and record pages through the
//! volume page cache. Sparse configurations sample a subset of names
//! ("hooks") into the volume index and fall back to a small cache of
//! recently referenced chapter indexes for the rest.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

#[macro_use]
extern crate tracing;

pub mod chapter_index;
pub mod delta_index;
pub mod geometry;
pub mod layout;
pub mod name;
pub mod open_chapter;
pub mod request;
pub mod session;
pub mod volume;
pub mod volume_index;

pub use geometry::{Geometry, MemorySize};
pub use name::{RecordMetadata, RecordName};
pub use request::{Request, RequestKind, Response};
pub use session::{IndexSession, OpenMode, SessionParams, SessionStats};
pub use volume::device::{BlockDevice, FileDevice};
