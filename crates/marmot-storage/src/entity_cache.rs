//! Per-channel entity index and cache accounting.
//!
//! Indexes live entities by object id and by type, owns the channel's used
//! cache size and the resumable live-check cursor. All of it is strictly
//! thread local to the owning channel; cross-channel effects only ever flow
//! through the mark monitor.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::entity::{Entity, EntityArena, NO_SLOT, Slot};
use crate::error::{Result, StorageError};
use crate::eviction::EntityCacheEvaluator;
use crate::oid::{self, IdAnalysis, ObjectId};
use crate::types::{EntityType, TypeDictionary};

pub(crate) struct EntityCache {
    channel_index: usize,
    channel_hash_modulo: u64,
    oid_index: FxHashMap<ObjectId, Slot>,
    pub(crate) types: Vec<EntityType>,
    tid_index: FxHashMap<ObjectId, usize>,
    root_type_index: usize,
    used_cache_size: u64,
    /// Resumable cache-check position: slot plus the object id expected
    /// there, revalidated on resume since slots are reused.
    live_cursor: Option<(Slot, ObjectId)>,
    type_dictionary: Arc<dyn TypeDictionary>,
}

impl std::fmt::Debug for EntityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityCache")
            .field("channel_index", &self.channel_index)
            .field("channel_hash_modulo", &self.channel_hash_modulo)
            .field("entity_count", &self.oid_index.len())
            .field("type_count", &self.types.len())
            .field("root_type_index", &self.root_type_index)
            .field("used_cache_size", &self.used_cache_size)
            .field("live_cursor", &self.live_cursor)
            .finish()
    }
}

impl EntityCache {
    pub(crate) fn new(
        channel_index: usize,
        channel_count: usize,
        root_type_id: ObjectId,
        type_dictionary: Arc<dyn TypeDictionary>,
        arena: &mut EntityArena,
    ) -> Result<Self> {
        let mut cache = Self {
            channel_index,
            channel_hash_modulo: channel_count as u64 - 1,
            oid_index: FxHashMap::default(),
            types: Vec::new(),
            tid_index: FxHashMap::default(),
            root_type_index: 0,
            used_cache_size: 0,
            live_cursor: None,
            type_dictionary,
        };
        cache.root_type_index = cache.get_or_create_type(arena, root_type_id)?;
        Ok(cache)
    }

    pub(crate) fn entity_count(&self) -> u64 {
        self.oid_index.len() as u64
    }

    pub(crate) fn cache_size(&self) -> u64 {
        self.used_cache_size
    }

    pub(crate) fn lookup_entity(&self, object_id: ObjectId) -> Option<Slot> {
        self.oid_index.get(&object_id).copied()
    }

    pub(crate) fn get_or_create_type(
        &mut self,
        arena: &mut EntityArena,
        type_id: ObjectId,
    ) -> Result<usize> {
        if let Some(index) = self.tid_index.get(&type_id) {
            return Ok(*index);
        }
        let handler = self
            .type_dictionary
            .lookup_type_handler(type_id)
            .ok_or(StorageError::UnknownType { type_id })?;
        let head = arena.alloc(Entity::sentinel());
        let index = self.types.len();
        self.types.push(EntityType::new(handler, head));
        self.tid_index.insert(type_id, index);
        Ok(index)
    }

    /// Looks up or creates the entity for `object_id`.
    ///
    /// Returns the slot and whether the entity was newly created. For an
    /// update the caller must drop stale cached data and detach the entity
    /// from its old file position before re-appending it.
    pub(crate) fn put_entity(
        &mut self,
        arena: &mut EntityArena,
        object_id: ObjectId,
        type_index: usize,
        now_ms: i64,
    ) -> (Slot, bool) {
        if let Some(slot) = self.lookup_entity(object_id) {
            return (slot, false);
        }
        let entity_type = &mut self.types[type_index];
        let slot = arena.alloc(Entity::new(
            object_id,
            type_index as Slot,
            entity_type.has_references,
        ));
        entity_type.add(arena, slot);
        self.oid_index.insert(object_id, slot);
        // overwrite the initial "touched in eternity" timestamp
        arena[slot].touch(now_ms);
        (slot, true)
    }

    pub(crate) fn unregister_entity(&mut self, object_id: ObjectId) {
        self.oid_index.remove(&object_id);
    }

    pub(crate) fn increase_used_cache_size(&mut self, amount: u64) {
        self.used_cache_size += amount;
    }

    /// Drops an entity's cached data, if any, and tracks the cache size.
    pub(crate) fn ensure_no_cached_data(&mut self, arena: &mut EntityArena, slot: Slot) {
        if arena[slot].is_live() {
            let freed = arena[slot].clear_cache();
            self.used_cache_size -= freed;
        }
    }

    /// Applies the evaluator to one live entity: either clears its cache or
    /// touches it to mark now as its last use.
    pub(crate) fn check_for_cache_clear(
        &mut self,
        arena: &mut EntityArena,
        slot: Slot,
        evaluation_time_ms: i64,
        evaluator: &dyn EntityCacheEvaluator,
    ) {
        if evaluator.clear_entity_cache(self.used_cache_size, evaluation_time_ms, &arena[slot]) {
            self.ensure_no_cached_data(arena, slot);
        } else {
            arena[slot].touch(evaluation_time_ms);
        }
    }

    /// Validates a stored entity against the registry: an existing entry
    /// must keep its type, a new object id must hash to this channel, and
    /// the length must pass the type handler's structural check.
    ///
    /// Returns the entity's type index.
    pub(crate) fn validate_entity(
        &mut self,
        arena: &mut EntityArena,
        length: u64,
        type_id: ObjectId,
        object_id: ObjectId,
    ) -> Result<usize> {
        let type_index = match self.lookup_entity(object_id) {
            Some(slot) => {
                let type_index = arena[slot].type_slot() as usize;
                let existing_type_id = self.types[type_index].type_id;
                if existing_type_id != type_id {
                    return Err(StorageError::TypeMismatch {
                        object_id,
                        existing_type_id,
                        requested_type_id: type_id,
                    });
                }
                type_index
            }
            None => {
                if oid::channel_of(object_id, self.channel_hash_modulo) != self.channel_index {
                    return Err(StorageError::InvalidObjectIdChannel {
                        object_id,
                        channel: self.channel_index,
                    });
                }
                self.get_or_create_type(arena, type_id)?
            }
        };

        if !self.types[type_index]
            .handler
            .is_valid_entity(length, object_id)
        {
            return Err(StorageError::InvalidEntityLength {
                object_id,
                type_id,
                length,
            });
        }
        Ok(type_index)
    }

    /// The highest object id among the channel's root entities, null if
    /// the channel holds none.
    pub(crate) fn query_root_object_id(&self, arena: &EntityArena) -> ObjectId {
        let root_type = &self.types[self.root_type_index];
        let mut max = oid::NULL_OBJECT_ID;
        let mut slot = arena[root_type.head].type_next;
        while slot != NO_SLOT {
            max = max.max(arena[slot].object_id());
            slot = arena[slot].type_next;
        }
        max
    }

    /// Walks all entities, validating each against its type handler, and
    /// yields the highest observed ids per range plus occurring type ids.
    pub(crate) fn validate_entities(&self, arena: &EntityArena) -> Result<IdAnalysis> {
        let mut analysis = IdAnalysis::default();
        for entity_type in &self.types {
            if entity_type.is_empty() {
                continue;
            }
            analysis.accept(entity_type.type_id);
            analysis.occurring_type_ids.push(entity_type.type_id);

            let mut slot = arena[entity_type.head].type_next;
            while slot != NO_SLOT {
                let entity = &arena[slot];
                if !entity_type
                    .handler
                    .is_valid_entity(entity.data_length(), entity.object_id())
                {
                    return Err(StorageError::InvalidEntityLength {
                        object_id: entity.object_id(),
                        type_id: entity_type.type_id,
                        length: entity.data_length(),
                    });
                }
                analysis.accept(entity.object_id());
                slot = entity.type_next;
            }
        }
        Ok(analysis)
    }

    /// Unconditionally evicts all cached data; returns the freed bytes.
    pub(crate) fn clear_cache(&mut self, arena: &mut EntityArena) -> u64 {
        let freed = self.used_cache_size;
        for type_index in 0..self.types.len() {
            let mut slot = arena[self.types[type_index].head].type_next;
            while slot != NO_SLOT {
                if arena[slot].is_live() {
                    let bytes = arena[slot].clear_cache();
                    self.used_cache_size -= bytes;
                }
                slot = arena[slot].type_next;
            }
        }
        debug_assert_eq!(self.used_cache_size, 0);
        self.live_cursor = None;
        freed
    }

    pub(crate) fn live_cursor(&self) -> Option<(Slot, ObjectId)> {
        self.live_cursor
    }

    pub(crate) fn set_live_cursor(&mut self, cursor: Option<(Slot, ObjectId)>) {
        self.live_cursor = cursor;
    }

    /// Shrinks the id index after the GC went idle.
    pub(crate) fn consolidate(&mut self) {
        self.oid_index.shrink_to_fit();
        self.tid_index.shrink_to_fit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::{FixedTypeDictionary, FlatReferenceType};

    const ROOT_TID: ObjectId = 10;
    const NODE_TID: ObjectId = 20;
    const BLOB_TID: ObjectId = 30;

    fn dictionary() -> Arc<FixedTypeDictionary> {
        FixedTypeDictionary::with(vec![
            Arc::new(FlatReferenceType::new(ROOT_TID, true)),
            Arc::new(FlatReferenceType::new(NODE_TID, true)),
            Arc::new(FlatReferenceType::new(BLOB_TID, false)),
        ])
    }

    fn cache(arena: &mut EntityArena) -> EntityCache {
        EntityCache::new(0, 1, ROOT_TID, dictionary(), arena).unwrap()
    }

    #[test]
    fn test_unknown_root_type_is_rejected() {
        let mut arena = EntityArena::new();
        let result = EntityCache::new(0, 1, 999, dictionary(), &mut arena);
        assert!(matches!(
            result.unwrap_err(),
            StorageError::UnknownType { type_id: 999 }
        ));
    }

    #[test]
    fn test_put_entity_creates_once() {
        let mut arena = EntityArena::new();
        let mut cache = cache(&mut arena);
        let node_type = cache.get_or_create_type(&mut arena, NODE_TID).unwrap();

        let (slot, created) = cache.put_entity(&mut arena, 1_000_000_001, node_type, 5);
        assert!(created);
        assert_eq!(arena[slot].last_touched(), 5);
        assert_eq!(cache.entity_count(), 1);

        let (again, created) = cache.put_entity(&mut arena, 1_000_000_001, node_type, 9);
        assert!(!created);
        assert_eq!(again, slot);
        assert_eq!(cache.entity_count(), 1);
    }

    #[test]
    fn test_validate_entity_type_mismatch() {
        let mut arena = EntityArena::new();
        let mut cache = cache(&mut arena);
        let node_type = cache.validate_entity(&mut arena, 8, NODE_TID, 1_000_000_001).unwrap();
        cache.put_entity(&mut arena, 1_000_000_001, node_type, 0);

        let error = cache
            .validate_entity(&mut arena, 8, BLOB_TID, 1_000_000_001)
            .unwrap_err();
        assert!(matches!(
            error,
            StorageError::TypeMismatch {
                existing_type_id: NODE_TID,
                requested_type_id: BLOB_TID,
                ..
            }
        ));
    }

    #[test]
    fn test_validate_entity_wrong_channel() {
        let mut arena = EntityArena::new();
        // channel 0 of 2: odd oids belong to channel 1
        let mut cache = EntityCache::new(0, 2, ROOT_TID, dictionary(), &mut arena).unwrap();
        let error = cache
            .validate_entity(&mut arena, 8, NODE_TID, 1_000_000_001)
            .unwrap_err();
        assert!(matches!(error, StorageError::InvalidObjectIdChannel { .. }));
    }

    #[test]
    fn test_cache_size_accounting() {
        let mut arena = EntityArena::new();
        let mut cache = cache(&mut arena);
        let node_type = cache.get_or_create_type(&mut arena, NODE_TID).unwrap();

        let (a, _) = cache.put_entity(&mut arena, 1_000_000_001, node_type, 0);
        let (b, _) = cache.put_entity(&mut arena, 1_000_000_002, node_type, 0);
        let added = arena[a].put_cached_data(vec![0; 100].into_boxed_slice());
        cache.increase_used_cache_size(added);
        let added = arena[b].put_cached_data(vec![0; 50].into_boxed_slice());
        cache.increase_used_cache_size(added);
        assert_eq!(cache.cache_size(), 150);

        cache.ensure_no_cached_data(&mut arena, a);
        assert_eq!(cache.cache_size(), 50);
        // idempotent
        cache.ensure_no_cached_data(&mut arena, a);
        assert_eq!(cache.cache_size(), 50);

        assert_eq!(cache.clear_cache(&mut arena), 50);
        assert_eq!(cache.cache_size(), 0);
    }

    #[test]
    fn test_query_root_object_id() {
        let mut arena = EntityArena::new();
        let mut cache = cache(&mut arena);
        assert_eq!(cache.query_root_object_id(&arena), 0);

        let root_type = cache.get_or_create_type(&mut arena, ROOT_TID).unwrap();
        cache.put_entity(&mut arena, 1_000_000_007, root_type, 0);
        cache.put_entity(&mut arena, 1_000_000_042, root_type, 0);
        cache.put_entity(&mut arena, 1_000_000_011, root_type, 0);
        assert_eq!(cache.query_root_object_id(&arena), 1_000_000_042);
    }

    #[test]
    fn test_validate_entities_id_analysis() {
        let mut arena = EntityArena::new();
        let mut cache = cache(&mut arena);
        let node_type = cache.get_or_create_type(&mut arena, NODE_TID).unwrap();
        let blob_type = cache.get_or_create_type(&mut arena, BLOB_TID).unwrap();

        cache.put_entity(&mut arena, 1_000_000_008, node_type, 0);
        cache.put_entity(&mut arena, 1_000_000_123, node_type, 0);
        cache.put_entity(&mut arena, 2_000_000, blob_type, 0);

        let analysis = cache.validate_entities(&arena).unwrap();
        assert_eq!(analysis.highest_oid, 1_000_000_123);
        assert_eq!(analysis.highest_cid, 2_000_000);
        // tids of occurring types are accounted as well
        assert_eq!(analysis.highest_tid, BLOB_TID);
        assert!(analysis.occurring_type_ids.contains(&NODE_TID));
        assert!(analysis.occurring_type_ids.contains(&BLOB_TID));
        // the root type holds no entities and does not occur
        assert!(!analysis.occurring_type_ids.contains(&ROOT_TID));
    }
}
