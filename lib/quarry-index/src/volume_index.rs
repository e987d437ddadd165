//! The volume index: the RAM-resident map from record name to virtual
//! chapter number, partitioned across zones.
//!
//! Each zone owns a contiguous run of delta lists over its own buffer; a
//! name belongs to exactly one zone, determined by its volume-index list
//! number, so zone workers never contend. Payloads store the chapter
//! number reduced to a window two volumes wide; entries whose chapter has
//! left the retained window are treated as absent and pruned the next
//! time their list is walked.

use bytes::{Buf, BufMut};
use parking_lot::Mutex;
use quarry_common::VirtualChapterNumber;
use snafu::Snafu;

use crate::delta_index::{DeltaIndex, DeltaIndexError};
use crate::geometry::{Geometry, VOLUME_INDEX_MEAN_DELTA};
use crate::name::RecordName;

/// Error produced by volume index operations.
#[derive(Debug, Snafu)]
pub enum VolumeIndexError {
    /// The underlying delta memory is full.
    #[snafu(display("volume index delta error: {}", source))]
    Delta { source: DeltaIndexError },

    /// A saved image could not be restored.
    #[snafu(display("invalid volume index image: {}", reason))]
    InvalidImage { reason: String },
}

/// Aggregated statistics across all zones.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VolumeIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub overflow_count: u64,
}

/// One zone's share of the volume index. Single-threaded by design; the
/// owning zone worker is the only writer.
struct VolumeIndexZone {
    delta: DeltaIndex,
    first_list: u32,
    newest_vcn: u64,
}

enum Found {
    Exact { vcn: u64 },
    Candidate { vcn: u64 },
    Absent,
}

impl VolumeIndexZone {
    fn new(geometry: &Geometry, first_list: u32, list_count: u32, zone_count: u32) -> Self {
        let capacity = geometry.records_per_volume() / u64::from(zone_count);
        VolumeIndexZone {
            delta: DeltaIndex::empty(
                list_count,
                VOLUME_INDEX_MEAN_DELTA,
                geometry.volume_index_payload_bits,
                capacity,
            ),
            first_list,
            newest_vcn: 0,
        }
    }

    fn encode_vcn(&self, geometry: &Geometry, vcn: u64) -> u64 {
        vcn & ((1u64 << geometry.volume_index_payload_bits) - 1)
    }

    /// Widens a stored payload back to an absolute chapter number, or
    /// `None` when the entry has aged out of the ring.
    fn decode_vcn(&self, geometry: &Geometry, payload: u64) -> Option<u64> {
        let window = 1u64 << geometry.volume_index_payload_bits;
        let high = self.newest_vcn & !(window - 1);
        let mut vcn = high | payload;
        if vcn > self.newest_vcn {
            vcn = vcn.checked_sub(window)?;
        }
        if geometry.has_aged_out(vcn, self.newest_vcn) {
            None
        } else {
            Some(vcn)
        }
    }

    /// Walks the entries sharing `name`'s address, pruning aged ones.
    /// Returns the exact collision match if present, otherwise the plain
    /// entry as a candidate.
    fn probe(&mut self, geometry: &Geometry, name: &RecordName) -> Result<Found, DeltaIndexError> {
        let list = name.volume_index_list(geometry) - self.first_list;
        let address = name.volume_index_address(geometry);
        'retry: loop {
            let mut cursor = self.delta.seek(list, address)?;
            if cursor.at_end || cursor.key != address {
                return Ok(Found::Absent);
            }
            let mut candidate = None;
            loop {
                match self.decode_vcn(geometry, self.delta.payload(&cursor)) {
                    None => {
                        // Aged out; prune and restart the walk, since
                        // removal exhausts the cursor.
                        self.delta.remove(&mut cursor)?;
                        continue 'retry;
                    }
                    Some(vcn) => {
                        if cursor.is_collision {
                            if self.delta.collision_name(&cursor).as_ref() == Some(&name.0) {
                                return Ok(Found::Exact { vcn });
                            }
                        } else {
                            candidate = Some(vcn);
                        }
                    }
                }
                if !self.delta.next_entry(&mut cursor) || cursor.key != address {
                    break;
                }
            }
            return Ok(match candidate {
                Some(vcn) => Found::Candidate { vcn },
                None => Found::Absent,
            });
        }
    }

    fn get_record(&mut self, geometry: &Geometry, name: &RecordName) -> Option<u64> {
        match self.probe(geometry, name).ok()? {
            Found::Exact { vcn } | Found::Candidate { vcn } => Some(vcn),
            Found::Absent => None,
        }
    }

    /// Records a fresh name. If the address group already holds an exact
    /// collision match the payload is refreshed in place; if the address
    /// is taken by other names the entry becomes a collision carrying the
    /// full name.
    fn put_record(
        &mut self,
        geometry: &Geometry,
        name: &RecordName,
        vcn: u64,
    ) -> Result<(), DeltaIndexError> {
        let list = name.volume_index_list(geometry) - self.first_list;
        let address = name.volume_index_address(geometry);
        let payload = self.encode_vcn(geometry, vcn);

        // Prune first so stale entries do not masquerade as the group.
        let _ = self.probe(geometry, name)?;

        let cursor = self.delta.seek(list, address)?;
        if !cursor.at_end && cursor.key == address {
            // Look for an exact collision match to refresh.
            let mut walk = cursor.clone();
            loop {
                if walk.is_collision
                    && self.delta.collision_name(&walk).as_ref() == Some(&name.0)
                {
                    self.delta.set_payload(&walk, payload);
                    return Ok(());
                }
                if !self.delta.next_entry(&mut walk) || walk.key != address {
                    break;
                }
            }
            self.delta.put(&cursor, address, payload, Some(&name.0))
        } else {
            self.delta.put(&cursor, address, payload, None)
        }
    }

    /// Refreshes the chapter of a name previously answered by
    /// [`get_record`]: the exact collision match if one exists, else the
    /// plain entry of the group.
    fn update_record(
        &mut self,
        geometry: &Geometry,
        name: &RecordName,
        vcn: u64,
    ) -> Result<(), DeltaIndexError> {
        let list = name.volume_index_list(geometry) - self.first_list;
        let address = name.volume_index_address(geometry);
        let payload = self.encode_vcn(geometry, vcn);

        let cursor = self.delta.seek(list, address)?;
        if cursor.at_end || cursor.key != address {
            return self.put_record(geometry, name, vcn);
        }
        let mut plain = None;
        let mut walk = cursor.clone();
        loop {
            if walk.is_collision {
                if self.delta.collision_name(&walk).as_ref() == Some(&name.0) {
                    self.delta.set_payload(&walk, payload);
                    return Ok(());
                }
            } else {
                plain = Some(walk.clone());
            }
            if !self.delta.next_entry(&mut walk) || walk.key != address {
                break;
            }
        }
        match plain {
            Some(entry) => {
                self.delta.set_payload(&entry, payload);
                Ok(())
            }
            None => self.put_record(geometry, name, vcn),
        }
    }

    fn remove_record(
        &mut self,
        geometry: &Geometry,
        name: &RecordName,
    ) -> Result<bool, DeltaIndexError> {
        let list = name.volume_index_list(geometry) - self.first_list;
        let address = name.volume_index_address(geometry);
        let cursor = self.delta.seek(list, address)?;
        if cursor.at_end || cursor.key != address {
            return Ok(false);
        }
        // Prefer the exact collision match; fall back to the plain
        // entry, which may stand in for any colliding name.
        let mut plain = None;
        let mut walk = cursor.clone();
        loop {
            if walk.is_collision {
                if self.delta.collision_name(&walk).as_ref() == Some(&name.0) {
                    let mut target = walk;
                    self.delta.remove(&mut target)?;
                    return Ok(true);
                }
            } else {
                plain = Some(walk.clone());
            }
            if !self.delta.next_entry(&mut walk) || walk.key != address {
                break;
            }
        }
        match plain {
            Some(mut entry) => {
                self.delta.remove(&mut entry)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// The zoned volume index.
pub struct VolumeIndex {
    zones: Vec<Mutex<VolumeIndexZone>>,
    lists_per_zone: u32,
    geometry: Geometry,
}

impl VolumeIndex {
    pub fn new(geometry: &Geometry, zone_count: u32) -> Self {
        assert!(zone_count > 0);
        let total = geometry.volume_index_delta_lists;
        let lists_per_zone = total.div_ceil(zone_count);
        let zones = (0..zone_count)
            .map(|z| {
                let first = z * lists_per_zone;
                let count = lists_per_zone.min(total - first.min(total)).max(1);
                Mutex::new(VolumeIndexZone::new(geometry, first, count, zone_count))
            })
            .collect();
        VolumeIndex {
            zones,
            lists_per_zone,
            geometry: geometry.clone(),
        }
    }

    pub fn zone_count(&self) -> u32 {
        self.zones.len() as u32
    }

    /// The zone owning a name. Deterministic: list number divided by the
    /// zone's list share.
    pub fn zone_for(&self, name: &RecordName) -> u32 {
        name.volume_index_list(&self.geometry) / self.lists_per_zone
    }

    pub fn get_record(&self, name: &RecordName) -> Option<VirtualChapterNumber> {
        let zone = self.zone_for(name);
        self.zones[zone as usize]
            .lock()
            .get_record(&self.geometry, name)
    }

    pub fn put_record(
        &self,
        name: &RecordName,
        vcn: VirtualChapterNumber,
    ) -> Result<(), VolumeIndexError> {
        let zone = self.zone_for(name);
        self.zones[zone as usize]
            .lock()
            .put_record(&self.geometry, name, vcn)
            .map_err(|source| VolumeIndexError::Delta { source })
    }

    pub fn update_record(
        &self,
        name: &RecordName,
        vcn: VirtualChapterNumber,
    ) -> Result<(), VolumeIndexError> {
        let zone = self.zone_for(name);
        self.zones[zone as usize]
            .lock()
            .update_record(&self.geometry, name, vcn)
            .map_err(|source| VolumeIndexError::Delta { source })
    }

    pub fn remove_record(&self, name: &RecordName) -> Result<bool, VolumeIndexError> {
        let zone = self.zone_for(name);
        self.zones[zone as usize]
            .lock()
            .remove_record(&self.geometry, name)
            .map_err(|source| VolumeIndexError::Delta { source })
    }

    /// Advances the aging window after a chapter close. Entries whose
    /// chapter left the window become invisible immediately and are
    /// pruned lazily.
    pub fn rollover(&self, newest_vcn: VirtualChapterNumber) {
        for zone in &self.zones {
            zone.lock().newest_vcn = newest_vcn;
        }
    }

    pub fn newest_vcn(&self) -> VirtualChapterNumber {
        self.zones[0].lock().newest_vcn
    }

    pub fn stats(&self) -> VolumeIndexStats {
        let mut stats = VolumeIndexStats::default();
        for zone in &self.zones {
            let zone = zone.lock();
            let delta = zone.delta.get_stats();
            stats.record_count += delta.record_count;
            stats.collision_count += delta.collision_count;
            stats.overflow_count += delta.overflow_count;
        }
        stats
    }

    /// Serializes all zones for the save image.
    pub fn save_to(&self, out: &mut Vec<u8>) {
        out.put_u32_le(self.zone_count());
        out.put_u32_le(self.lists_per_zone);
        for zone in &self.zones {
            let zone = zone.lock();
            out.put_u64_le(zone.newest_vcn);
            out.put_u32_le(zone.first_list);
            let mut image = Vec::new();
            zone.delta.save_to(&mut image);
            out.put_u64_le(image.len() as u64);
            out.extend_from_slice(&image);
        }
    }

    /// Restores a volume index saved with [`save_to`](Self::save_to).
    /// The zone count must match the session's configuration.
    pub fn load_from(
        geometry: &Geometry,
        zone_count: u32,
        mut input: &[u8],
    ) -> Result<Self, VolumeIndexError> {
        let invalid = |reason: String| VolumeIndexError::InvalidImage { reason };
        if input.remaining() < 8 {
            return Err(invalid("truncated header".to_string()));
        }
        let saved_zones = input.get_u32_le();
        let lists_per_zone = input.get_u32_le();
        if saved_zones != zone_count {
            return Err(invalid(format!(
                "image has {saved_zones} zones, session configured {zone_count}"
            )));
        }
        let mut zones = Vec::with_capacity(zone_count as usize);
        for _ in 0..zone_count {
            if input.remaining() < 20 {
                return Err(invalid("truncated zone header".to_string()));
            }
            let newest_vcn = input.get_u64_le();
            let first_list = input.get_u32_le();
            let len = usize::try_from(input.get_u64_le()).expect("image length fits usize");
            if input.remaining() < len {
                return Err(invalid("truncated zone image".to_string()));
            }
            let delta = DeltaIndex::load_from(&input[..len])
                .map_err(|e| invalid(format!("zone image: {e}")))?;
            input.advance(len);
            zones.push(Mutex::new(VolumeIndexZone {
                delta,
                first_list,
                newest_vcn,
            }));
        }
        Ok(VolumeIndex {
            zones,
            lists_per_zone,
            geometry: geometry.clone(),
        })
    }
}
