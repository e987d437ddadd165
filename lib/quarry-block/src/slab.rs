//! The slab-depot interface: physical allocation and reference counts.
//!
//! The depot is an external collaborator. The block layer allocates
//! data blocks, increments the reference of a newly mapped block, and
//! decrements the reference of the block a mapping used to point at.
//! Reference underflow is a logic violation that must latch the layer
//! read-only, so the trait reports it instead of panicking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quarry_common::PhysicalBlockNumber;
use snafu::Snafu;

/// Error produced by allocator operations.
#[derive(Debug, Eq, PartialEq, Snafu)]
pub enum SlabError {
    /// No free blocks remain.
    #[snafu(display("slab depot exhausted"))]
    NoSpace,

    /// A reference count would drop below zero.
    #[snafu(display("reference underflow on pbn {}", pbn))]
    RefCountUnderflow { pbn: PhysicalBlockNumber },
}

/// What the block layer requires of the slab depot.
pub trait PhysicalAllocator: Send + Sync {
    /// Allocates a free data block with a reference count of one.
    fn allocate(&self) -> Result<PhysicalBlockNumber, SlabError>;

    /// Adjusts a block's reference count by +1 or -1; a block reaching
    /// zero returns to the free pool.
    fn adjust_reference(&self, pbn: PhysicalBlockNumber, increment: bool)
        -> Result<(), SlabError>;
}

/// In-memory depot double: sequential allocation from a bounded range
/// with real reference counting.
pub struct FakeDepot {
    first_pbn: u64,
    block_count: u64,
    next: AtomicU64,
    references: Mutex<HashMap<PhysicalBlockNumber, u32>>,
}

impl FakeDepot {
    pub fn new(first_pbn: u64, block_count: u64) -> Self {
        assert!(first_pbn > 0, "pbn 0 is reserved for unmapped");
        FakeDepot {
            first_pbn,
            block_count,
            next: AtomicU64::new(first_pbn),
            references: Mutex::new(HashMap::new()),
        }
    }

    pub fn reference_count(&self, pbn: PhysicalBlockNumber) -> u32 {
        self.references.lock().get(&pbn).copied().unwrap_or(0)
    }
}

impl PhysicalAllocator for FakeDepot {
    fn allocate(&self) -> Result<PhysicalBlockNumber, SlabError> {
        let pbn = self.next.fetch_add(1, Ordering::SeqCst);
        if pbn >= self.first_pbn + self.block_count {
            return Err(SlabError::NoSpace);
        }
        self.references.lock().insert(pbn, 1);
        Ok(pbn)
    }

    fn adjust_reference(
        &self,
        pbn: PhysicalBlockNumber,
        increment: bool,
    ) -> Result<(), SlabError> {
        let mut references = self.references.lock();
        let count = references.entry(pbn).or_insert(0);
        if increment {
            *count += 1;
        } else {
            if *count == 0 {
                return Err(SlabError::RefCountUnderflow { pbn });
            }
            *count -= 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn allocation_and_references() {
        let depot = FakeDepot::new(100, 2);
        let a = depot.allocate().unwrap();
        let b = depot.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(depot.allocate(), Err(SlabError::NoSpace));

        depot.adjust_reference(a, true).unwrap();
        assert_eq!(depot.reference_count(a), 2);
        depot.adjust_reference(a, false).unwrap();
        depot.adjust_reference(a, false).unwrap();
        assert_eq!(
            depot.adjust_reference(a, false),
            Err(SlabError::RefCountUnderflow { pbn: a })
        );
    }
}
