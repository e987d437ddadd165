//! The recovery-journal interface.
//!
//! The journal itself is an external collaborator; the block layer only
//! needs to append mapping changes, learn the advancing era point, and
//! hold per-sequence locks while dirty pages still depend on journal
//! entries that have not reached their slab journals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use quarry_common::{LogicalBlockNumber, PhysicalBlockNumber, SequenceNumber};

/// What a journal entry describes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JournalEntryKind {
    /// A logical-to-physical data mapping change.
    DataMapping,
    /// A block-map tree page coming into existence.
    TreePage,
}

/// One mapping change recorded in the journal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct JournalEntry {
    pub kind: JournalEntryKind,
    pub lbn: LogicalBlockNumber,
    pub pbn: PhysicalBlockNumber,
    pub increment: bool,
}

/// What the block layer requires of the recovery journal.
pub trait RecoveryJournal: Send + Sync {
    /// Appends an entry; returns the sequence number it was recorded
    /// under.
    fn append(&self, entry: JournalEntry) -> SequenceNumber;

    /// The newest advertised era point. Pages dirtied under sequence
    /// numbers below it belong to completed eras.
    fn current_era_point(&self) -> SequenceNumber;

    /// Pins `sequence` until every page dirtied under it is durably
    /// written.
    fn acquire_lock(&self, sequence: SequenceNumber);

    /// Releases a pin taken with [`acquire_lock`](Self::acquire_lock).
    fn release_lock(&self, sequence: SequenceNumber);
}

/// In-memory journal double: appends are sequence-stamped and the era
/// point advances every `era_interval` appends.
pub struct FakeJournal {
    next_sequence: AtomicU64,
    era_interval: u64,
    entries: Mutex<Vec<(SequenceNumber, JournalEntry)>>,
    locks: Mutex<HashMap<SequenceNumber, u64>>,
}

impl FakeJournal {
    pub fn new(era_interval: u64) -> Self {
        FakeJournal {
            next_sequence: AtomicU64::new(1),
            era_interval: era_interval.max(1),
            entries: Mutex::new(Vec::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn entries(&self) -> Vec<(SequenceNumber, JournalEntry)> {
        self.entries.lock().clone()
    }

    /// Outstanding lock pins; empty when all writeback completed.
    pub fn held_locks(&self) -> Vec<SequenceNumber> {
        let locks = self.locks.lock();
        let mut held: Vec<_> = locks
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&seq, _)| seq)
            .collect();
        held.sort_unstable();
        held
    }
}

impl RecoveryJournal for FakeJournal {
    fn append(&self, entry: JournalEntry) -> SequenceNumber {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.entries.lock().push((sequence, entry));
        sequence
    }

    fn current_era_point(&self) -> SequenceNumber {
        let next = self.next_sequence.load(Ordering::SeqCst);
        (next / self.era_interval) * self.era_interval
    }

    fn acquire_lock(&self, sequence: SequenceNumber) {
        *self.locks.lock().entry(sequence).or_insert(0) += 1;
    }

    fn release_lock(&self, sequence: SequenceNumber) {
        let mut locks = self.locks.lock();
        let count = locks.get_mut(&sequence).expect("lock was held");
        assert!(*count > 0, "journal lock underflow");
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn sequences_are_monotone_and_era_advances() {
        let journal = FakeJournal::new(4);
        let entry = JournalEntry {
            kind: JournalEntryKind::DataMapping,
            lbn: 1,
            pbn: 2,
            increment: true,
        };
        let first = journal.append(entry);
        let second = journal.append(entry);
        assert!(second > first);
        for _ in 0..8 {
            journal.append(entry);
        }
        assert!(journal.current_era_point() >= 8);
    }

    #[test]
    fn locks_pair_up() {
        let journal = FakeJournal::new(1);
        journal.acquire_lock(5);
        journal.acquire_lock(5);
        journal.release_lock(5);
        assert_eq!(journal.held_locks(), vec![5]);
        journal.release_lock(5);
        assert_eq!(journal.held_locks(), Vec::<u64>::new());
    }
}
