//! Object identifiers and channel partitioning.
//!
//! Every persisted record is addressed by a 64-bit object id. Three disjoint
//! numeric ranges distinguish type descriptors (TID), constants (CID) and
//! object instances (OID); `0` is the null id and is never stored or marked.

/// A 64-bit object identifier.
pub type ObjectId = u64;

/// The null id. Never stored, enqueued or marked.
pub const NULL_OBJECT_ID: ObjectId = 0;

/// First id of the type-descriptor (TID) range.
pub const TYPE_ID_START: ObjectId = 1;

/// First id of the constant (CID) range, exclusive upper bound of the TID range.
pub const CONSTANT_ID_START: ObjectId = 1_000_000;

/// First id of the object-instance (OID) range, exclusive upper bound of the CID range.
pub const OBJECT_ID_START: ObjectId = 1_000_000_000;

/// Maximum number of channels a storage may be partitioned into.
pub const MAX_CHANNEL_COUNT: usize = 64;

/// The id range an object id falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdRange {
    /// Type descriptor id.
    Tid,
    /// Constant id.
    Cid,
    /// Object instance id.
    Oid,
}

/// Classify an id by its numeric range. Returns `None` for the null id.
pub fn classify(id: ObjectId) -> Option<IdRange> {
    if id == NULL_OBJECT_ID {
        None
    } else if id < CONSTANT_ID_START {
        Some(IdRange::Tid)
    } else if id < OBJECT_ID_START {
        Some(IdRange::Cid)
    } else {
        Some(IdRange::Oid)
    }
}

/// The channel owning `object_id`, given `channel_count - 1` as hash modulo.
///
/// Channel counts are powers of two, so ownership is a plain mask.
#[inline]
pub fn channel_of(object_id: ObjectId, channel_hash_modulo: u64) -> usize {
    (object_id & channel_hash_modulo) as usize
}

/// Validates a channel count: a power of two in `[1, MAX_CHANNEL_COUNT]`.
pub fn is_valid_channel_count(channel_count: usize) -> bool {
    channel_count >= 1 && channel_count <= MAX_CHANNEL_COUNT && channel_count.is_power_of_two()
}

/// Highest observed ids per range plus the set of occurring type ids.
///
/// Produced once per channel during initialization and merged by the
/// id-allocation subsystem to seed its id counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdAnalysis {
    /// Highest observed object-instance id, 0 if none.
    pub highest_oid: ObjectId,
    /// Highest observed constant id, 0 if none.
    pub highest_cid: ObjectId,
    /// Highest observed type id, 0 if none.
    pub highest_tid: ObjectId,
    /// Type ids with at least one live entity.
    pub occurring_type_ids: Vec<ObjectId>,
}

impl IdAnalysis {
    /// Account for one observed id.
    pub fn accept(&mut self, id: ObjectId) {
        match classify(id) {
            Some(IdRange::Tid) => self.highest_tid = self.highest_tid.max(id),
            Some(IdRange::Cid) => self.highest_cid = self.highest_cid.max(id),
            Some(IdRange::Oid) => self.highest_oid = self.highest_oid.max(id),
            None => {}
        }
    }

    /// Merge another analysis (e.g. from a different channel) into this one.
    pub fn merge(&mut self, other: &IdAnalysis) {
        self.highest_oid = self.highest_oid.max(other.highest_oid);
        self.highest_cid = self.highest_cid.max(other.highest_cid);
        self.highest_tid = self.highest_tid.max(other.highest_tid);
        for tid in &other.occurring_type_ids {
            if !self.occurring_type_ids.contains(tid) {
                self.occurring_type_ids.push(*tid);
            }
        }
    }
}
