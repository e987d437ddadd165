//! Cross-subsystem scenario suite.
//!
//! Each module seeds one of the system's contract scenarios end to end,
//! against in-memory or file-backed devices small enough to fill and
//! wrap whole volumes quickly.

mod helpers;

mod block_map;
mod chapter_packing;
mod dedup_index;
mod lvm;
mod super_block;
mod suspend_resume;
