//! Type descriptors and the external type handler seam.
//!
//! The serialization layer owns the actual binary layout; this core only
//! consumes the narrow [`TypeHandler`] surface: reference iteration over an
//! entity's serialized bytes plus structural length validation.

use std::sync::Arc;

use crate::entity::{EntityArena, NO_SLOT, Slot};
use crate::oid::ObjectId;

/// Per-type behavior supplied by the serialization layer.
pub trait TypeHandler: Send + Sync {
    /// The handled type's id.
    fn type_id(&self) -> ObjectId;

    /// Whether entities of this type carry reference fields.
    fn has_references(&self) -> bool;

    /// Number of fixed-offset references, or `None` for a variable layout.
    fn simple_reference_count(&self) -> Option<usize> {
        None
    }

    /// Minimum valid serialized length of one entity.
    fn minimum_length(&self) -> u64;

    /// Maximum valid serialized length of one entity.
    fn maximum_length(&self) -> u64;

    /// Calls `visitor` for every reference id in the serialized entity data.
    /// Null ids may be passed through; consumers filter them.
    fn iterate_references(&self, data: &[u8], visitor: &mut dyn FnMut(ObjectId));

    /// Structural validation of an entity guaranteed to be of this type.
    fn is_valid_entity(&self, length: u64, object_id: ObjectId) -> bool {
        let _ = object_id;
        length >= self.minimum_length() && length <= self.maximum_length()
    }
}

/// Lookup of type handlers by type id. Schema management stays external.
pub trait TypeDictionary: Send + Sync {
    /// The handler for `type_id`, if the type is known.
    fn lookup_type_handler(&self, type_id: ObjectId) -> Option<Arc<dyn TypeHandler>>;
}

/// Per-channel descriptor grouping all live entities of one type.
///
/// Entities are chained singly with a head sentinel and appended at the
/// tail; removal passes the predecessor, which the sweep tracks anyway.
pub(crate) struct EntityType {
    pub(crate) type_id: ObjectId,
    pub(crate) handler: Arc<dyn TypeHandler>,
    pub(crate) has_references: bool,
    pub(crate) entity_count: u64,
    /// Sentinel entity heading the live chain.
    pub(crate) head: Slot,
    /// Last chain entity; equals `head` while empty.
    pub(crate) tail: Slot,
}

impl EntityType {
    pub(crate) fn new(handler: Arc<dyn TypeHandler>, head: Slot) -> Self {
        Self {
            type_id: handler.type_id(),
            has_references: handler.has_references(),
            handler,
            entity_count: 0,
            head,
            tail: head,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entity_count == 0
    }

    /// Appends `slot` at the chain tail.
    pub(crate) fn add(&mut self, arena: &mut EntityArena, slot: Slot) {
        arena[slot].type_next = NO_SLOT;
        arena[self.tail].type_next = slot;
        self.tail = slot;
        self.entity_count += 1;
    }

    /// Unchains `slot`, whose predecessor is `prev`.
    pub(crate) fn remove(&mut self, arena: &mut EntityArena, slot: Slot, prev: Slot) {
        debug_assert_eq!(arena[prev].type_next, slot);
        arena[prev].type_next = arena[slot].type_next;
        arena[slot].type_next = NO_SLOT;
        if self.tail == slot {
            self.tail = prev;
        }
        self.entity_count -= 1;
    }
}
