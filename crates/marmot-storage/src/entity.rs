//! Entity records and the per-channel entity arena.
//!
//! Entities are arena-allocated and linked by slot indices instead of
//! pointers: singly into their type's live chain and doubly into their data
//! file's chain. Chain ends are sentinel entities occupying reserved arena
//! slots, which keeps traversal free of end-of-chain special cases.

use crate::oid::{NULL_OBJECT_ID, ObjectId};

/// Arena slot index. `NO_SLOT` terminates chains.
pub(crate) type Slot = u32;

/// Chain terminator / "no entity" marker.
pub(crate) const NO_SLOT: Slot = u32::MAX;

/// Tri-color GC state, plus the fresh state of just created/updated entities.
///
/// black: reachable, references fully traversed
/// gray : reachable, reference traversal pending
/// initial: created or updated this round; not marked, but not collectible
/// white: not marked, candidate for reclamation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GcColor {
    /// Not marked; condemned unless visited before the sweep.
    White,
    /// Freshly created or updated; survives the current round unmarked.
    Initial,
    /// Marked; reference traversal still pending.
    Gray,
    /// Marked; references fully traversed.
    Black,
}

/// One persisted object instance as tracked by its owning channel.
#[derive(Debug)]
pub struct Entity {
    object_id: ObjectId,
    type_slot: Slot,
    file_slot: Slot,
    storage_position: u64,
    data_length: u32,
    cache: Option<Box<[u8]>>,
    last_touched: i64,
    color: GcColor,
    deleted: bool,
    has_references: bool,

    // chain links
    pub(crate) type_next: Slot,
    pub(crate) file_next: Slot,
    pub(crate) file_prev: Slot,
}

impl Entity {
    pub(crate) fn new(object_id: ObjectId, type_slot: Slot, has_references: bool) -> Self {
        Self {
            object_id,
            type_slot,
            file_slot: NO_SLOT,
            storage_position: 0,
            data_length: 0,
            cache: None,
            // initially "touched in eternity"; creation explicitly touches
            last_touched: i64::MAX,
            color: GcColor::Initial,
            deleted: false,
            has_references,
            type_next: NO_SLOT,
            file_next: NO_SLOT,
            file_prev: NO_SLOT,
        }
    }

    /// A chain-end sentinel. Zero length, null object id, touched in eternity.
    pub(crate) fn sentinel() -> Self {
        Self::new(NULL_OBJECT_ID, NO_SLOT, false)
    }

    /// The entity's biunique identifying id.
    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Whether this is a real entity rather than a chain sentinel.
    pub fn is_proper(&self) -> bool {
        self.object_id != NULL_OBJECT_ID
    }

    /// Whether the entity's type has reference fields.
    pub fn has_references(&self) -> bool {
        self.has_references
    }

    /// Byte offset of the entity's record within its data file.
    pub fn storage_position(&self) -> u64 {
        self.storage_position
    }

    /// The entity's serialized data length in bytes.
    pub fn data_length(&self) -> u64 {
        self.data_length as u64
    }

    /// The bytes this entity currently occupies in the cache, 0 if evicted.
    pub fn cached_data_length(&self) -> u64 {
        self.cache.as_ref().map_or(0, |c| c.len() as u64)
    }

    /// Millisecond timestamp of the last touch. May lie in the future.
    pub fn last_touched(&self) -> i64 {
        self.last_touched
    }

    /// Whether entity data is currently cached.
    pub fn is_live(&self) -> bool {
        self.cache.is_some()
    }

    pub(crate) fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Current GC color.
    pub fn color(&self) -> GcColor {
        self.color
    }

    /// Marked in the current epoch, i.e. not collectible by the next sweep.
    pub(crate) fn is_gc_marked(&self) -> bool {
        self.color != GcColor::White
    }

    pub(crate) fn is_gc_black(&self) -> bool {
        self.color == GcColor::Black
    }

    pub(crate) fn mark_white(&mut self) {
        self.color = GcColor::White;
    }

    pub(crate) fn mark_gray(&mut self) {
        self.color = GcColor::Gray;
    }

    pub(crate) fn mark_black(&mut self) {
        self.color = GcColor::Black;
    }

    pub(crate) fn type_slot(&self) -> Slot {
        self.type_slot
    }

    pub(crate) fn file_slot(&self) -> Slot {
        self.file_slot
    }

    pub(crate) fn set_file_slot(&mut self, file_slot: Slot) {
        self.file_slot = file_slot;
    }

    pub(crate) fn touch(&mut self, now_ms: i64) {
        self.last_touched = now_ms;
    }

    pub(crate) fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub(crate) fn update_storage_information(&mut self, data_length: u32, position: u64) {
        self.data_length = data_length;
        self.storage_position = position;
    }

    /// Cached bytes, if any.
    pub(crate) fn cached_data(&self) -> Option<&[u8]> {
        self.cache.as_deref()
    }

    /// Installs cached data, returning the cache size increase.
    pub(crate) fn put_cached_data(&mut self, data: Box<[u8]>) -> u64 {
        let added = data.len() as u64;
        debug_assert!(self.cache.is_none(), "cache must be cleared before reload");
        self.cache = Some(data);
        added
    }

    /// Drops cached data, returning the freed byte count.
    pub(crate) fn clear_cache(&mut self) -> u64 {
        self.cache.take().map_or(0, |c| c.len() as u64)
    }
}

/// Slot-indexed entity storage with slot reuse.
///
/// Owned exclusively by one channel's thread; cross-channel communication
/// happens via object ids, never via slots.
#[derive(Debug, Default)]
pub(crate) struct EntityArena {
    slots: Vec<Entity>,
    free: Vec<Slot>,
}

impl EntityArena {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn alloc(&mut self, entity: Entity) -> Slot {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot as usize] = entity;
                slot
            }
            None => {
                let slot = self.slots.len() as Slot;
                self.slots.push(entity);
                slot
            }
        }
    }

    /// Releases a slot for reuse. The entity must already be unlinked.
    pub(crate) fn release(&mut self, slot: Slot) {
        debug_assert!(self.slots[slot as usize].is_deleted() || !self.slots[slot as usize].is_proper());
        self.free.push(slot);
    }

    pub(crate) fn get(&self, slot: Slot) -> &Entity {
        &self.slots[slot as usize]
    }

    pub(crate) fn get_mut(&mut self, slot: Slot) -> &mut Entity {
        &mut self.slots[slot as usize]
    }
}

impl std::ops::Index<Slot> for EntityArena {
    type Output = Entity;

    fn index(&self, slot: Slot) -> &Entity {
        self.get(slot)
    }
}

impl std::ops::IndexMut<Slot> for EntityArena {
    fn index_mut(&mut self, slot: Slot) -> &mut Entity {
        self.get_mut(slot)
    }
}
