//! The delta index: a bit-packed sorted set of (key, payload) pairs
//! organized as many delta lists over one flat buffer.
//!
//! Keys within a list are stored as variable-length gaps (deltas) from
//! the previous key: a Rice-style unary+binary code where the count of
//! leading one bits selects the code class and a fixed-width binary
//! remainder completes the gap. Each entry carries a fixed-width payload;
//! entries whose key equals their predecessor's are collision entries and
//! additionally carry the full 16-byte record name so lookups can
//! disambiguate.
//!
//! Lists share the buffer contiguously, separated by slack. An insert
//! that outgrows its list's slack triggers a rebalance that redistributes
//! free space; when the whole buffer is exhausted the operation fails
//! with `Overflow` and the caller decides whether that is fatal (volume
//! index) or a silent drop (chapter index).

mod bit_ops;

use bytes::{Buf, BufMut};
use snafu::Snafu;

pub(crate) use bit_ops::BitBuffer;

/// Bits in a collision entry's full-name suffix.
pub const COLLISION_BITS: u32 = 128;

/// Error produced by delta index operations.
#[derive(Debug, Snafu)]
pub enum DeltaIndexError {
    /// The delta memory cannot absorb the entry.
    #[snafu(display("delta memory overflow: needed {} bits, {} free", needed, free))]
    Overflow { needed: u64, free: u64 },

    /// A list number fell outside the index.
    #[snafu(display("delta list {} out of range ({} lists)", list, count))]
    ListOutOfRange { list: u32, count: u32 },

    /// A saved image could not be restored.
    #[snafu(display("invalid delta index image: {}", reason))]
    InvalidImage { reason: String },
}

/// Point-in-time statistics for one delta index.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeltaIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub bits_used: u64,
    pub bit_capacity: u64,
    pub overflow_count: u64,
    pub list_count: u32,
}

#[derive(Clone, Copy, Debug)]
struct ListInfo {
    start: u64,
    size: u64,
}

/// A cursor over one delta list.
///
/// Produced by [`DeltaIndex::start_search`] or [`DeltaIndex::seek`],
/// advanced by [`DeltaIndex::next_entry`]. After a mutation through the
/// cursor it is exhausted; re-seek to continue.
#[derive(Clone, Debug)]
pub struct DeltaCursor {
    pub list: u32,
    rel: u64,
    next_rel: u64,
    pub key: u64,
    delta: u64,
    delta_len: u32,
    pub is_collision: bool,
    pub at_end: bool,
    seen: bool,
    prev_key: u64,
}

/// A bit-packed delta index over `list_count` lists.
pub struct DeltaIndex {
    memory: BitBuffer,
    lists: Vec<ListInfo>,
    payload_bits: u32,
    min_bits: u32,
    mean_delta: u32,
    list_bit_cap: Option<u64>,
    record_count: u64,
    collision_count: u64,
    overflow_count: u64,
}

impl DeltaIndex {
    /// Creates an empty index sized for `capacity_entries` entries of
    /// mean gap `mean_delta`, each with `payload_bits` of payload.
    pub fn empty(
        list_count: u32,
        mean_delta: u32,
        payload_bits: u32,
        capacity_entries: u64,
    ) -> Self {
        assert!(list_count > 0);
        assert!(payload_bits > 0 && payload_bits <= 56);
        let min_bits = rice_parameter(mean_delta);
        let bits_per_entry = u64::from(min_bits) + 2 + u64::from(payload_bits);
        // A fifth of slack absorbs skewed lists before a rebalance is
        // forced, plus one spare entry per list so empty indexes still
        // accept inserts.
        let capacity_bits = (capacity_entries.max(u64::from(list_count)) * bits_per_entry * 6 / 5
            + u64::from(list_count) * bits_per_entry)
            .next_multiple_of(64);
        let memory = BitBuffer::new(capacity_bits);
        let gap = capacity_bits / u64::from(list_count);
        let lists = (0..list_count)
            .map(|i| ListInfo {
                start: u64::from(i) * gap,
                size: 0,
            })
            .collect();
        DeltaIndex {
            memory,
            lists,
            payload_bits,
            min_bits,
            mean_delta,
            list_bit_cap: None,
            record_count: 0,
            collision_count: 0,
            overflow_count: 0,
        }
    }

    /// Caps every list at `cap_bits`; inserts that would exceed the cap
    /// fail with `Overflow` even when buffer space remains. The chapter
    /// index uses this to keep every list packable into one page.
    pub fn with_list_cap(mut self, cap_bits: u64) -> Self {
        self.list_bit_cap = Some(cap_bits);
        self
    }

    pub fn list_count(&self) -> u32 {
        self.lists.len() as u32
    }

    pub fn payload_bits(&self) -> u32 {
        self.payload_bits
    }

    pub fn list_size_bits(&self, list: u32) -> u64 {
        self.lists[list as usize].size
    }

    pub fn get_stats(&self) -> DeltaIndexStats {
        DeltaIndexStats {
            record_count: self.record_count,
            collision_count: self.collision_count,
            bits_used: self.lists.iter().map(|l| l.size).sum(),
            bit_capacity: self.memory.bit_capacity(),
            overflow_count: self.overflow_count,
            list_count: self.list_count(),
        }
    }

    /// Positions a cursor before the first entry of `list`.
    pub fn start_search(&self, list: u32) -> Result<DeltaCursor, DeltaIndexError> {
        self.check_list(list)?;
        Ok(DeltaCursor {
            list,
            rel: 0,
            next_rel: 0,
            key: 0,
            delta: 0,
            delta_len: 0,
            is_collision: false,
            at_end: false,
            seen: false,
            prev_key: 0,
        })
    }

    /// Advances the cursor to the next entry. Returns `false` once the
    /// list is exhausted.
    pub fn next_entry(&self, cursor: &mut DeltaCursor) -> bool {
        if cursor.at_end {
            return false;
        }
        let info = self.lists[cursor.list as usize];
        let pos = cursor.next_rel;
        if pos >= info.size {
            cursor.at_end = true;
            return false;
        }
        if cursor.seen {
            cursor.prev_key = cursor.key;
        }
        let (delta, delta_len) = self.read_delta(info.start + pos, info.start + info.size);
        let is_collision = cursor.seen && delta == 0;
        cursor.rel = pos;
        cursor.key += delta;
        cursor.delta = delta;
        cursor.delta_len = delta_len;
        cursor.is_collision = is_collision;
        cursor.next_rel = pos
            + u64::from(delta_len)
            + u64::from(self.payload_bits)
            + if is_collision { u64::from(COLLISION_BITS) } else { 0 };
        cursor.seen = true;
        true
    }

    /// Positions a cursor at the first entry whose key is at least
    /// `key`, or at the end of the list.
    pub fn seek(&self, list: u32, key: u64) -> Result<DeltaCursor, DeltaIndexError> {
        let mut cursor = self.start_search(list)?;
        while self.next_entry(&mut cursor) {
            if cursor.key >= key {
                break;
            }
        }
        Ok(cursor)
    }

    /// The payload of the entry under the cursor.
    pub fn payload(&self, cursor: &DeltaCursor) -> u64 {
        debug_assert!(cursor.seen && !cursor.at_end);
        let info = self.lists[cursor.list as usize];
        self.memory.get(
            info.start + cursor.rel + u64::from(cursor.delta_len),
            self.payload_bits,
        )
    }

    /// Overwrites the payload of the entry under the cursor in place.
    pub fn set_payload(&mut self, cursor: &DeltaCursor, payload: u64) {
        debug_assert!(cursor.seen && !cursor.at_end);
        let info = self.lists[cursor.list as usize];
        self.memory.set(
            info.start + cursor.rel + u64::from(cursor.delta_len),
            self.payload_bits,
            payload,
        );
    }

    /// The full-name suffix of a collision entry.
    pub fn collision_name(&self, cursor: &DeltaCursor) -> Option<[u8; 16]> {
        if !cursor.is_collision {
            return None;
        }
        let info = self.lists[cursor.list as usize];
        let offset = info.start
            + cursor.rel
            + u64::from(cursor.delta_len)
            + u64::from(self.payload_bits);
        let mut bytes = Vec::with_capacity(16);
        self.memory.export_bytes(offset, u64::from(COLLISION_BITS), &mut bytes);
        Some(bytes.try_into().expect("16 bytes"))
    }

    /// Inserts an entry at the cursor position.
    ///
    /// Without `name` this is a plain insert: the cursor must sit at the
    /// first entry with a larger key (or at the end), and the successor's
    /// gap is rewritten around the new entry. With `name` it is a
    /// collision insert: the cursor must sit at an entry with the same
    /// key, and the new entry lands just after it with a zero gap and the
    /// full-name suffix.
    pub fn put(
        &mut self,
        cursor: &DeltaCursor,
        key: u64,
        payload: u64,
        name: Option<&[u8; 16]>,
    ) -> Result<(), DeltaIndexError> {
        self.check_list(cursor.list)?;
        debug_assert!(payload < (1u64 << self.payload_bits));
        match name {
            None => {
                debug_assert!(cursor.at_end || cursor.key > key);
                let prev_key = if cursor.at_end {
                    if cursor.seen { cursor.key } else { 0 }
                } else {
                    cursor.prev_key
                };
                let new_delta = key - prev_key;
                let mut scratch = Scratch::new();
                scratch.push_delta(self.min_bits, new_delta);
                scratch.push_bits(self.payload_bits, payload);
                if cursor.at_end {
                    let end = self.lists[cursor.list as usize].size;
                    self.splice(cursor.list, end, end, &scratch)?;
                } else {
                    scratch.push_delta(self.min_bits, cursor.key - key);
                    self.splice(
                        cursor.list,
                        cursor.rel,
                        cursor.rel + u64::from(cursor.delta_len),
                        &scratch,
                    )?;
                }
                self.record_count += 1;
            }
            Some(name) => {
                debug_assert!(!cursor.at_end && cursor.key == key);
                let mut scratch = Scratch::new();
                scratch.push_delta(self.min_bits, 0);
                scratch.push_bits(self.payload_bits, payload);
                scratch.push_name(name);
                self.splice(cursor.list, cursor.next_rel, cursor.next_rel, &scratch)?;
                self.record_count += 1;
                self.collision_count += 1;
            }
        }
        Ok(())
    }

    /// Removes the entry under the cursor. The cursor is exhausted
    /// afterwards; re-seek to continue walking the list.
    pub fn remove(&mut self, cursor: &mut DeltaCursor) -> Result<(), DeltaIndexError> {
        self.check_list(cursor.list)?;
        debug_assert!(cursor.seen && !cursor.at_end);
        let info = self.lists[cursor.list as usize];
        if cursor.is_collision {
            let scratch = Scratch::new();
            self.splice(cursor.list, cursor.rel, cursor.next_rel, &scratch)?;
            self.collision_count -= 1;
        } else if cursor.next_rel >= info.size {
            // Last entry of the list.
            let scratch = Scratch::new();
            self.splice(cursor.list, cursor.rel, cursor.next_rel, &scratch)?;
        } else {
            let (succ_delta, succ_len) =
                self.read_delta(info.start + cursor.next_rel, info.start + info.size);
            if succ_delta == 0 {
                // The successor is a collision on the removed key;
                // promote it to the base entry. The promoted entry keeps
                // its payload and sheds the name suffix.
                let payload_off =
                    info.start + cursor.next_rel + u64::from(succ_len);
                let payload = self.memory.get(payload_off, self.payload_bits);
                let removed_end = cursor.next_rel
                    + u64::from(succ_len)
                    + u64::from(self.payload_bits)
                    + u64::from(COLLISION_BITS);
                let mut scratch = Scratch::new();
                scratch.push_delta(self.min_bits, cursor.delta);
                scratch.push_bits(self.payload_bits, payload);
                self.splice(cursor.list, cursor.rel, removed_end, &scratch)?;
                self.collision_count -= 1;
            } else {
                // Merge the removed gap into the successor's.
                let mut scratch = Scratch::new();
                scratch.push_delta(self.min_bits, cursor.delta + succ_delta);
                self.splice(
                    cursor.list,
                    cursor.rel,
                    cursor.next_rel + u64::from(succ_len),
                    &scratch,
                )?;
            }
        }
        self.record_count -= 1;
        cursor.at_end = true;
        Ok(())
    }

    /// Appends the packed bytes of one list to `out`.
    pub fn export_list(&self, list: u32, out: &mut Vec<u8>) {
        let info = self.lists[list as usize];
        self.memory.export_bytes(info.start, info.size, out);
    }

    /// Restores one list from packed bytes. The list must be empty.
    pub fn import_list(
        &mut self,
        list: u32,
        size_bits: u64,
        bytes: &[u8],
    ) -> Result<(), DeltaIndexError> {
        self.check_list(list)?;
        assert_eq!(self.lists[list as usize].size, 0, "list must be empty");
        if bytes.len() as u64 * 8 < size_bits {
            return Err(DeltaIndexError::InvalidImage {
                reason: format!("list {list} short: {size_bits} bits from {} bytes", bytes.len()),
            });
        }
        self.ensure_room(list, size_bits)?;
        let info = self.lists[list as usize];
        self.memory.import_bytes(info.start, size_bits, bytes);
        self.lists[list as usize].size = size_bits;
        let (records, collisions) = self.count_list(list);
        self.record_count += records;
        self.collision_count += collisions;
        Ok(())
    }

    /// Serializes the whole index (header, list sizes, list bits).
    pub fn save_to(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.list_count());
        out.put_u32_le(self.payload_bits);
        out.put_u32_le(self.min_bits);
        out.put_u32_le(self.mean_delta);
        out.put_u64_le(self.record_count);
        out.put_u64_le(self.collision_count);
        out.put_u64_le(self.memory.bit_capacity());
        for info in &self.lists {
            out.put_u32_le(u32::try_from(info.size).expect("list size fits u32"));
        }
        for info in &self.lists {
            let mut bytes = Vec::with_capacity(usize::try_from(info.size.div_ceil(8)).unwrap());
            self.memory.export_bytes(info.start, info.size, &mut bytes);
            out.extend_from_slice(&bytes);
        }
    }

    /// Restores an index saved with [`save_to`](Self::save_to).
    pub fn load_from(mut input: &[u8]) -> Result<Self, DeltaIndexError> {
        let invalid = |reason: &str| DeltaIndexError::InvalidImage {
            reason: reason.to_string(),
        };
        if input.remaining() < 40 {
            return Err(invalid("truncated header"));
        }
        let list_count = input.get_u32_le();
        let payload_bits = input.get_u32_le();
        let min_bits = input.get_u32_le();
        let mean_delta = input.get_u32_le();
        let record_count = input.get_u64_le();
        let collision_count = input.get_u64_le();
        let bit_capacity = input.get_u64_le();
        if list_count == 0 || payload_bits == 0 || payload_bits > 56 {
            return Err(invalid("bad header fields"));
        }
        if input.remaining() < list_count as usize * 4 {
            return Err(invalid("truncated list table"));
        }
        let sizes: Vec<u64> = (0..list_count).map(|_| u64::from(input.get_u32_le())).collect();
        let used: u64 = sizes.iter().sum();
        if used > bit_capacity {
            return Err(invalid("list sizes exceed capacity"));
        }
        let free = bit_capacity - used;
        let gap = free / u64::from(list_count);
        let mut memory = BitBuffer::new(bit_capacity);
        let mut lists = Vec::with_capacity(list_count as usize);
        let mut pos = 0u64;
        for &size in &sizes {
            let byte_len = usize::try_from(size.div_ceil(8)).expect("size fits usize");
            if input.remaining() < byte_len {
                return Err(invalid("truncated list bits"));
            }
            memory.import_bytes(pos, size, &input[..byte_len]);
            input.advance(byte_len);
            lists.push(ListInfo { start: pos, size });
            pos += size + gap;
        }
        Ok(DeltaIndex {
            memory,
            lists,
            payload_bits,
            min_bits,
            mean_delta,
            list_bit_cap: None,
            record_count,
            collision_count,
            overflow_count: 0,
        })
    }

    fn check_list(&self, list: u32) -> Result<(), DeltaIndexError> {
        if (list as usize) < self.lists.len() {
            Ok(())
        } else {
            Err(DeltaIndexError::ListOutOfRange {
                list,
                count: self.list_count(),
            })
        }
    }

    fn count_list(&self, list: u32) -> (u64, u64) {
        let mut cursor = self.start_search(list).expect("list checked");
        let mut records = 0;
        let mut collisions = 0;
        while self.next_entry(&mut cursor) {
            records += 1;
            if cursor.is_collision {
                collisions += 1;
            }
        }
        (records, collisions)
    }

    fn read_delta(&self, offset: u64, limit: u64) -> (u64, u32) {
        let mut quotient = 0u64;
        let mut pos = offset;
        loop {
            debug_assert!(pos < limit, "unary run past list end");
            let n = (limit - pos).min(32) as u32;
            let chunk = self.memory.get(pos, n);
            let ones = chunk.trailing_ones();
            if ones < n {
                quotient += u64::from(ones);
                pos += u64::from(ones) + 1;
                break;
            }
            quotient += u64::from(n);
            pos += u64::from(n);
        }
        let remainder = self.memory.get(pos, self.min_bits);
        pos += u64::from(self.min_bits);
        (
            (quotient << self.min_bits) | remainder,
            u32::try_from(pos - offset).expect("delta code length fits u32"),
        )
    }

    fn splice(
        &mut self,
        list: u32,
        rel_start: u64,
        rel_end: u64,
        scratch: &Scratch,
    ) -> Result<(), DeltaIndexError> {
        let removed = rel_end - rel_start;
        let added = scratch.len;
        let old_size = self.lists[list as usize].size;
        let new_size = old_size - removed + added;
        if let Some(cap) = self.list_bit_cap {
            if new_size > cap {
                self.overflow_count += 1;
                return Err(DeltaIndexError::Overflow {
                    needed: new_size - cap,
                    free: 0,
                });
            }
        }
        if added > removed {
            self.ensure_room(list, added - removed)?;
        }
        let info = self.lists[list as usize];
        let abs_start = info.start + rel_start;
        let abs_end = info.start + rel_end;
        self.memory
            .move_bits(abs_end, abs_start + added, info.size - rel_end);
        self.memory.copy_from(&scratch.buf, 0, abs_start, added);
        self.lists[list as usize].size = new_size;
        Ok(())
    }

    /// Makes at least `need` bits of slack available after `list`,
    /// rebalancing the whole buffer when the neighbouring gap is spent.
    fn ensure_room(&mut self, list: u32, need: u64) -> Result<(), DeltaIndexError> {
        let idx = list as usize;
        let list_end = self.lists[idx].start + self.lists[idx].size;
        let next_start = self
            .lists
            .get(idx + 1)
            .map_or(self.memory.bit_capacity(), |l| l.start);
        if next_start - list_end >= need {
            return Ok(());
        }
        let used: u64 = self.lists.iter().map(|l| l.size).sum();
        let free = self.memory.bit_capacity() - used;
        if free < need {
            self.overflow_count += 1;
            return Err(DeltaIndexError::Overflow { needed: need, free });
        }
        trace!(list, need, free, "rebalancing delta memory");
        let spare = (free - need) / u64::from(self.list_count());
        let mut fresh = BitBuffer::new(self.memory.bit_capacity());
        let mut pos = 0u64;
        let mut new_lists = Vec::with_capacity(self.lists.len());
        for (i, info) in self.lists.iter().enumerate() {
            fresh.copy_from(&self.memory, info.start, pos, info.size);
            new_lists.push(ListInfo {
                start: pos,
                size: info.size,
            });
            pos += info.size + spare + if i == idx { need } else { 0 };
        }
        self.memory = fresh;
        self.lists = new_lists;
        Ok(())
    }
}

/// Rice parameter (binary remainder width) tuned for a geometric gap
/// distribution with the given mean: log2 of `mean * ln 2`.
fn rice_parameter(mean_delta: u32) -> u32 {
    let scaled = (u64::from(mean_delta) * 693 / 1000).max(2);
    (63 - scaled.leading_zeros()).max(1)
}

struct Scratch {
    buf: BitBuffer,
    len: u64,
}

impl Scratch {
    fn new() -> Self {
        // Largest splice content: delta code + payload + name suffix.
        // The unary run of a worst-case gap (full address span over the
        // smallest Rice remainder in use) stays under 16 Ki bits.
        Scratch {
            buf: BitBuffer::new(16384),
            len: 0,
        }
    }

    fn push_bits(&mut self, nbits: u32, value: u64) {
        self.buf.set(self.len, nbits, value);
        self.len += u64::from(nbits);
    }

    fn push_delta(&mut self, min_bits: u32, delta: u64) {
        let mut quotient = delta >> min_bits;
        while quotient > 0 {
            let n = quotient.min(64) as u32;
            let ones = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
            self.push_bits(n, ones);
            quotient -= u64::from(n);
        }
        self.push_bits(1, 0);
        self.push_bits(min_bits, delta & ((1u64 << min_bits) - 1));
    }

    fn push_name(&mut self, name: &[u8; 16]) {
        self.buf.import_bytes(self.len, u64::from(COLLISION_BITS), name);
        self.len += u64::from(COLLISION_BITS);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn collect(index: &DeltaIndex, list: u32) -> Vec<(u64, u64, bool)> {
        let mut cursor = index.start_search(list).unwrap();
        let mut entries = Vec::new();
        while index.next_entry(&mut cursor) {
            entries.push((cursor.key, index.payload(&cursor), cursor.is_collision));
        }
        entries
    }

    fn put_key(index: &mut DeltaIndex, list: u32, key: u64, payload: u64) {
        let cursor = index.seek(list, key).unwrap();
        index.put(&cursor, key, payload, None).unwrap();
    }

    #[test]
    fn inserts_keep_keys_sorted() {
        let mut index = DeltaIndex::empty(4, 1024, 8, 1000);
        for key in [500u64, 100, 900, 250, 750] {
            put_key(&mut index, 1, key, key & 0xff);
        }
        let entries = collect(&index, 1);
        assert_eq!(
            entries,
            vec![
                (100, 100, false),
                (250, 250, false),
                (500, 500 & 0xff, false),
                (750, 750 & 0xff, false),
                (900, 900 & 0xff, false),
            ]
        );
        assert_eq!(index.get_stats().record_count, 5);
        // Other lists untouched.
        assert!(collect(&index, 0).is_empty());
    }

    #[test]
    fn collision_entries_carry_names() {
        let mut index = DeltaIndex::empty(2, 1024, 8, 100);
        put_key(&mut index, 0, 42, 1);
        let cursor = index.seek(0, 42).unwrap();
        let name = [7u8; 16];
        index.put(&cursor, 42, 2, Some(&name)).unwrap();
        let entries = collect(&index, 0);
        assert_eq!(entries, vec![(42, 1, false), (42, 2, true)]);
        let mut cursor = index.start_search(0).unwrap();
        assert!(index.next_entry(&mut cursor));
        assert_eq!(index.collision_name(&cursor), None);
        assert!(index.next_entry(&mut cursor));
        assert_eq!(index.collision_name(&cursor), Some(name));
        assert_eq!(index.get_stats().collision_count, 1);
    }

    #[test]
    fn remove_merges_gaps() {
        let mut index = DeltaIndex::empty(1, 256, 8, 100);
        for key in [10u64, 20, 30] {
            put_key(&mut index, 0, key, key);
        }
        let mut cursor = index.seek(0, 20).unwrap();
        index.remove(&mut cursor).unwrap();
        assert_eq!(collect(&index, 0), vec![(10, 10, false), (30, 30, false)]);
        // Remove the head; the next entry absorbs the full gap.
        let mut cursor = index.seek(0, 10).unwrap();
        index.remove(&mut cursor).unwrap();
        assert_eq!(collect(&index, 0), vec![(30, 30, false)]);
        let mut cursor = index.seek(0, 30).unwrap();
        index.remove(&mut cursor).unwrap();
        assert!(collect(&index, 0).is_empty());
        assert_eq!(index.get_stats().record_count, 0);
    }

    #[test]
    fn removing_base_promotes_collision() {
        let mut index = DeltaIndex::empty(1, 256, 8, 100);
        put_key(&mut index, 0, 50, 1);
        let cursor = index.seek(0, 50).unwrap();
        index.put(&cursor, 50, 2, Some(&[9u8; 16])).unwrap();
        put_key(&mut index, 0, 80, 3);

        let mut cursor = index.seek(0, 50).unwrap();
        assert!(!cursor.is_collision);
        index.remove(&mut cursor).unwrap();

        let entries = collect(&index, 0);
        assert_eq!(entries, vec![(50, 2, false), (80, 3, false)]);
        assert_eq!(index.get_stats().collision_count, 0);
    }

    #[test]
    fn set_payload_in_place() {
        let mut index = DeltaIndex::empty(1, 256, 10, 100);
        put_key(&mut index, 0, 5, 1);
        put_key(&mut index, 0, 6, 2);
        let mut cursor = index.seek(0, 5).unwrap();
        index.set_payload(&cursor, 1000);
        assert_eq!(index.payload(&cursor), 1000);
        assert!(index.next_entry(&mut cursor));
        assert_eq!(index.payload(&cursor), 2);
    }

    #[test]
    fn skewed_load_rebalances_instead_of_overflowing() {
        // Everything lands in list 0, far past its even share.
        let mut index = DeltaIndex::empty(8, 256, 8, 400);
        for key in 0..300u64 {
            put_key(&mut index, 0, key * 3 + 1, key & 0xff);
        }
        assert_eq!(index.get_stats().record_count, 300);
        assert_eq!(collect(&index, 0).len(), 300);
    }

    #[test]
    fn exhausted_memory_reports_overflow() {
        let mut index = DeltaIndex::empty(1, 256, 8, 4);
        let mut result = Ok(());
        for key in 0..200u64 {
            let cursor = index.seek(0, key + 1).unwrap();
            result = index.put(&cursor, key + 1, 0, None);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(DeltaIndexError::Overflow { .. })));
        assert!(index.get_stats().overflow_count > 0);
    }

    #[test]
    fn list_cap_bounds_single_list() {
        let mut index = DeltaIndex::empty(2, 256, 8, 10_000).with_list_cap(256);
        let mut inserted = 0;
        for key in 0..1000u64 {
            let cursor = index.seek(0, key + 1).unwrap();
            if index.put(&cursor, key + 1, 0, None).is_ok() {
                inserted += 1;
            }
        }
        assert!(inserted > 0 && inserted < 1000, "inserted {inserted}");
        assert!(index.list_size_bits(0) <= 256);
    }

    #[test]
    fn save_load_round_trip() {
        let mut index = DeltaIndex::empty(4, 1024, 12, 500);
        for key in 0..100u64 {
            put_key(&mut index, (key % 4) as u32, key * 7 + 1, key % 4096);
        }
        let cursor = index.seek(2, 7 * 2 + 1).unwrap();
        index.put(&cursor, 7 * 2 + 1, 99, Some(&[3u8; 16])).unwrap();

        let mut image = Vec::new();
        index.save_to(&mut image);
        let restored = DeltaIndex::load_from(&image).unwrap();

        assert_eq!(restored.get_stats().record_count, 101);
        assert_eq!(restored.get_stats().collision_count, 1);
        for list in 0..4 {
            assert_eq!(collect(&index, list), collect(&restored, list));
        }
    }

    #[test]
    fn export_import_single_list() {
        let mut index = DeltaIndex::empty(3, 512, 8, 200);
        for key in [11u64, 97, 403, 404] {
            put_key(&mut index, 1, key, key & 0xff);
        }
        let size = index.list_size_bits(1);
        let mut bytes = Vec::new();
        index.export_list(1, &mut bytes);

        let mut fresh = DeltaIndex::empty(3, 512, 8, 200);
        fresh.import_list(1, size, &bytes).unwrap();
        assert_eq!(collect(&fresh, 1), collect(&index, 1));
        assert_eq!(fresh.get_stats().record_count, 4);
    }

    #[test]
    fn truncated_image_is_rejected() {
        let mut index = DeltaIndex::empty(2, 256, 8, 50);
        put_key(&mut index, 0, 9, 9);
        let mut image = Vec::new();
        index.save_to(&mut image);
        image.truncate(image.len() - 1);
        assert!(matches!(
            DeltaIndex::load_from(&image),
            Err(DeltaIndexError::InvalidImage { .. })
        ));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn random_inserts_match_sorted_model(keys in proptest::collection::vec(1u64..100_000, 1..200)) {
            let mut index = DeltaIndex::empty(4, 4096, 10, 400);
            let mut model: Vec<u64> = Vec::new();
            for &key in &keys {
                if model.contains(&key) {
                    continue;
                }
                let cursor = index.seek(2, key).unwrap();
                index.put(&cursor, key, key & 0x3ff, None).unwrap();
                model.push(key);
            }
            model.sort_unstable();
            let entries = collect(&index, 2);
            let got: Vec<u64> = entries.iter().map(|(k, _, _)| *k).collect();
            prop_assert_eq!(got, model);
            for (key, payload, collision) in entries {
                prop_assert_eq!(payload, key & 0x3ff);
                prop_assert!(!collision);
            }
        }
    }
}
