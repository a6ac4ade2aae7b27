//! The storage channel: one hash partition of the object-id space.
//!
//! A channel exclusively owns its entity arena, entity cache, data file
//! ring and mark queue consumption, and is driven by exactly one thread.
//! It polls the mark monitor between request-processing slices to decide
//! whether to mark, sweep or idle, bounded by caller-supplied time budgets.
//! Budget exhaustion is a normal pause signal: all mark/sweep progress is
//! durable in the queue and chain structures, never in a call stack.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{HousekeepingConfig, StorageConfiguration};
use crate::data_file::{DataFileEvaluator, FileManager, FileSummary, FileUsage};
use crate::entity::{EntityArena, NO_SLOT, Slot};
use crate::entity_cache::EntityCache;
use crate::error::Result;
use crate::eviction::EntityCacheEvaluator;
use crate::io::{FileIdentity, FileNumberProvider, StorageIo};
use crate::mark_monitor::{MarkMonitor, ReferenceMarker};
use crate::mark_queue::MarkQueue;
use crate::oid::{IdAnalysis, ObjectId};

/// Policy for reference ids that resolve to no known entity.
///
/// Zombie ids are not an error per se: legitimate races exist between
/// removing the last reference to an entity and a store re-establishing it.
pub trait ZombieOidHandler: Send + Sync {
    /// Returns whether the zombie id was handled. An unhandled id is logged.
    fn handle_zombie_oid(&self, object_id: ObjectId) -> bool;
}

/// Default zombie policy: ignore and continue.
#[derive(Debug, Default)]
pub struct IgnoreZombieOids;

impl ZombieOidHandler for IgnoreZombieOids {
    fn handle_zombie_oid(&self, _object_id: ObjectId) -> bool {
        true
    }
}

/// One stored entity as handed over by the store commit.
///
/// Only the minimal header is defined here (id, type, serialized bytes);
/// the byte layout of the data itself belongs to the serialization layer.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    /// The entity's object id. Must hash to the receiving channel.
    pub object_id: ObjectId,
    /// The entity's type id.
    pub type_id: ObjectId,
    /// The entity's serialized bytes.
    pub data: Vec<u8>,
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// One channel of the storage: owns a shard of the entity space.
pub struct StorageChannel {
    channel_index: usize,
    arena: EntityArena,
    cache: EntityCache,
    files: FileManager,
    monitor: Arc<MarkMonitor>,
    queue: Arc<MarkQueue>,
    marker: ReferenceMarker,
    evaluator: Arc<dyn EntityCacheEvaluator>,
    zombie_handler: Arc<dyn ZombieOidHandler>,
    marking_buffer: Vec<ObjectId>,
    marking_wait: Duration,
    /// Whether the current store hit a channel with a sweep pending, which
    /// changes how stored entities are re-marked.
    has_update_pending_sweep: bool,
    sweep_generation: u64,
}

impl StorageChannel {
    /// Creates the channel and its initial head data file.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_index: usize,
        config: &StorageConfiguration,
        monitor: Arc<MarkMonitor>,
        type_dictionary: Arc<dyn crate::types::TypeDictionary>,
        evaluator: Arc<dyn EntityCacheEvaluator>,
        zombie_handler: Arc<dyn ZombieOidHandler>,
        io: Box<dyn StorageIo>,
        file_numbers: Box<dyn FileNumberProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let mut arena = EntityArena::new();
        let cache = EntityCache::new(
            channel_index,
            config.channel_count,
            config.root_type_id,
            type_dictionary,
            &mut arena,
        )?;
        let files = FileManager::new(
            channel_index,
            io,
            file_numbers,
            DataFileEvaluator::from_config(&config.data_files)?,
            &mut arena,
        )?;
        let queue = Arc::clone(monitor.queue(channel_index));
        let marker = Arc::clone(&monitor).provide_reference_marker();
        Ok(Self {
            channel_index,
            arena,
            cache,
            files,
            monitor,
            queue,
            marker,
            evaluator,
            zombie_handler,
            marking_buffer: vec![0; config.marking_buffer_length],
            marking_wait: Duration::from_millis(config.marking_wait_ms),
            has_update_pending_sweep: false,
            sweep_generation: 0,
        })
    }

    /// This channel's index.
    pub fn channel_index(&self) -> usize {
        self.channel_index
    }

    /// Number of live entities registered in this channel.
    pub fn entity_count(&self) -> u64 {
        self.cache.entity_count()
    }

    /// Bytes currently held in this channel's entity cache.
    pub fn cache_size(&self) -> u64 {
        self.cache.cache_size()
    }

    /// Whether an entity for `object_id` is registered.
    pub fn contains_entity(&self, object_id: ObjectId) -> bool {
        self.cache.lookup_entity(object_id).is_some()
    }

    /// Whether the entity's data is currently cached; `None` if unknown id.
    pub fn is_entity_cached(&self, object_id: ObjectId) -> Option<bool> {
        self.cache
            .lookup_entity(object_id)
            .map(|slot| self.arena[slot].is_live())
    }

    /// Per-file state in ring order, head first.
    pub fn file_summaries(&self) -> Vec<FileSummary> {
        self.files.file_summaries()
    }

    /// Number of data files in this channel's ring.
    pub fn file_count(&self) -> usize {
        self.files.file_count()
    }

    /// Identity of the file currently accepting appends.
    pub fn head_file_identity(&self) -> FileIdentity {
        self.files.head_file_identity()
    }

    /// Registers an outstanding reader of the file numbered `number`,
    /// blocking its deletion while the returned guard is alive.
    pub fn register_file_usage(&self, number: u64) -> Option<FileUsage> {
        self.files.register_usage(number)
    }

    /// Completed sweeps of this channel.
    pub fn sweep_generation(&self) -> u64 {
        self.sweep_generation
    }

    // -----------------------------------------------------------------
    // store ingestion
    // -----------------------------------------------------------------

    /// Must be called before a store's entities become visible; flags the
    /// pending store and reactivates the GC in one atomic step.
    pub fn register_pending_store_update(&self) {
        self.monitor.register_pending_store_update(self.channel_index);
    }

    /// Clears this channel's pending-store flag. Idempotent; also called
    /// by [`StorageChannel::post_store_put_entities`] itself.
    pub fn clear_pending_store_update(&mut self) {
        self.has_update_pending_sweep = false;
        self.monitor.clear_pending_store_update(self.channel_index);
    }

    /// Registers a committed store's entities: validates and indexes them,
    /// appends their bytes to the head file, caches their data and forces
    /// them re-markable for the next mark pass.
    pub fn post_store_put_entities(&mut self, records: Vec<EntityRecord>) -> Result<()> {
        self.has_update_pending_sweep = self.monitor.is_pending_sweep(self.channel_index);

        // also reset here, in case the store happened before a sweep and
        // this post-store processing happens after it
        self.monitor.reset_completion();

        let now = now_millis();
        for record in records {
            let slot = self.put_stored_entity(record, now)?;
            self.mark_entity_for_changed_data(slot);
        }

        // done by the store task's cleanup as well, but it is idempotent
        self.clear_pending_store_update();
        Ok(())
    }

    fn put_stored_entity(&mut self, record: EntityRecord, now: i64) -> Result<Slot> {
        let length = record.data.len() as u64;
        let type_index =
            self.cache
                .validate_entity(&mut self.arena, length, record.type_id, record.object_id)?;
        let (slot, created) =
            self.cache
                .put_entity(&mut self.arena, record.object_id, type_index, now);
        if !created {
            // superseded version: drop its stale cache and leave its old
            // bytes behind as a gap
            self.cache.ensure_no_cached_data(&mut self.arena, slot);
            self.files.remove_entity(&mut self.arena, slot);
        }
        self.files.append(&mut self.arena, slot, &record.data)?;
        let added = self.arena[slot].put_cached_data(record.data.into_boxed_slice());
        self.cache.increase_used_cache_size(added);
        self.arena[slot].touch(now);
        Ok(slot)
    }

    /// Re-marks a stored entity for the GC.
    ///
    /// With a sweep pending, marking is already complete: everything is
    /// marked black without enqueuing, since re-enqueuing would rescue
    /// entities that are not reachable at all. During incomplete marking,
    /// referential entities are forced gray and enqueued for re-traversal
    /// ("slipped through" prevention); reference-free entities go straight
    /// to black.
    fn mark_entity_for_changed_data(&mut self, slot: Slot) {
        if self.has_update_pending_sweep {
            if !self.arena[slot].is_gc_black() {
                self.arena[slot].mark_black();
            }
            return;
        }

        if self.arena[slot].has_references() {
            self.arena[slot].mark_gray();
            // always via the monitor to keep the central count consistent,
            // never directly via the queue
            self.monitor.enqueue(self.arena[slot].object_id());
            return;
        }

        self.arena[slot].mark_black();
    }

    // -----------------------------------------------------------------
    // garbage collection
    // -----------------------------------------------------------------

    /// Runs incremental GC work (sweep if due, else marking) until work or
    /// time runs out. Returns `true` if work ran out, `false` on deadline.
    pub fn incremental_garbage_collection(&mut self, deadline: Instant) -> Result<bool> {
        if self.check_for_gc_completion() {
            return Ok(true);
        }

        if self.monitor.needs_sweep(self.channel_index)? {
            self.sweep()?;

            // re-check, otherwise this channel might restart marking
            // beyond a completed collection
            if self.check_for_gc_completion() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
        }

        self.incremental_mark(deadline)
    }

    /// Blocking GC variant for explicitly issued collections: when local
    /// work runs out but the epoch is incomplete, waits (bounded) on the
    /// own mark queue for cross-channel work, re-checking completion on
    /// every wakeup. Returns whether the collection completed in time.
    pub fn issued_garbage_collection(&mut self, deadline: Instant) -> Result<bool> {
        'perform_gc: while Instant::now() < deadline {
            if !self.incremental_garbage_collection(deadline)? {
                // time ran out mid-work
                return Ok(false);
            }
            // ran out of work before running out of time; wait for more
            while Instant::now() < deadline {
                if self.monitor.is_complete(self.channel_index) {
                    return Ok(true);
                }
                if self.monitor.is_marking_complete() {
                    // a sweep may now be due
                    continue 'perform_gc;
                }
                // flush buffered local reference ids before waiting for
                // other channels' marking to feed this queue
                self.marker.try_flush();
                if self.queue.wait_for_elements(self.marking_wait) {
                    continue 'perform_gc;
                }
            }
        }
        Ok(self.monitor.is_complete(self.channel_index))
    }

    fn check_for_gc_completion(&mut self) -> bool {
        if self.monitor.is_complete(self.channel_index) {
            // minimize index memory while the storage may stay inactive
            self.cache.consolidate();
            return true;
        }
        false
    }

    fn advance_marking_batch(&mut self, amount: usize) -> Result<()> {
        // enqueue buffered reference ids before the pending count shrinks
        self.marker.try_flush();
        self.monitor.advance_marking(self.channel_index, amount)
    }

    /// Drains this channel's mark queue in batches, marking entities and
    /// routing their reference ids to the owning channels. Returns `true`
    /// if the queue ran dry, `false` if the deadline struck first. At
    /// least one id is processed per call to prevent starvation.
    fn incremental_mark(&mut self, deadline: Instant) -> Result<bool> {
        let evaluation_time = now_millis();
        let mut amount = 0usize;
        let mut index = 0usize;

        loop {
            if index >= amount {
                self.advance_marking_batch(index)?;
                index = 0;
                amount = self.queue.get_next(&mut self.marking_buffer);
                if amount == 0 {
                    // ran out of work before time ran out
                    return Ok(true);
                }
            }

            let object_id = self.marking_buffer[index];
            index += 1;
            self.mark_one(object_id, evaluation_time)?;

            if Instant::now() >= deadline {
                break;
            }
        }

        // time ran out: the already processed part of the batch must still
        // be accounted for
        if index > 0 {
            self.advance_marking_batch(index)?;
        }
        Ok(false)
    }

    fn mark_one(&mut self, object_id: ObjectId, evaluation_time: i64) -> Result<()> {
        let Some(slot) = self.cache.lookup_entity(object_id) else {
            if !self.zombie_handler.handle_zombie_oid(object_id) {
                tracing::warn!(
                    target: "marmot::gc",
                    object_id,
                    "GC marking encountered zombie object id"
                );
            }
            return Ok(());
        };

        // redundantly enqueued ids may resolve to already-black entities
        if self.arena[slot].is_gc_black() {
            return Ok(());
        }

        if self.arena[slot].has_references() {
            let loaded = self.iterate_reference_ids(slot)?;
            if loaded {
                // marking required loading: re-evaluate the cache right away
                self.cache.check_for_cache_clear(
                    &mut self.arena,
                    slot,
                    evaluation_time,
                    self.evaluator.as_ref(),
                );
            }
        }

        // fully processed: references enqueued gray or none present
        self.arena[slot].mark_black();
        Ok(())
    }

    /// Feeds the entity's reference ids into the reference batcher,
    /// loading the entity data from its file if it was evicted.
    /// Returns whether a load happened.
    fn iterate_reference_ids(&mut self, slot: Slot) -> Result<bool> {
        let loaded = if self.arena[slot].is_live() {
            false
        } else {
            let data = self.files.load_entity_data(&self.arena, slot)?;
            let added = self.arena[slot].put_cached_data(data);
            self.cache.increase_used_cache_size(added);
            true
        };

        let handler =
            Arc::clone(&self.cache.types[self.arena[slot].type_slot() as usize].handler);
        let marker = &mut self.marker;
        let data = self.arena[slot]
            .cached_data()
            .expect("entity data cached for marking");
        handler.iterate_references(data, &mut |oid| marker.accept_object_id(oid));
        Ok(loaded)
    }

    /// Sweeps this channel's shard: marked entities survive reset to
    /// white, unmarked entities are reclaimed. Afterwards reports the
    /// channel's root oid to the monitor and restarts file housekeeping.
    fn sweep(&mut self) -> Result<()> {
        let started = Instant::now();
        let mut reclaimed = 0u64;
        let mut remaining = 0u64;

        for type_index in 0..self.cache.types.len() {
            let head = self.cache.types[type_index].head;
            let mut last = head;
            loop {
                let item = self.arena[last].type_next;
                if item == NO_SLOT {
                    break;
                }
                if self.arena[item].is_gc_marked() {
                    // reset to white and advance one item
                    self.arena[item].mark_white();
                    remaining += 1;
                    last = item;
                } else {
                    reclaimed += self.arena[item].data_length();
                    self.delete_entity(item, type_index, last);
                }
            }
        }

        self.sweep_generation += 1;
        tracing::debug!(
            target: "marmot::gc",
            channel = self.channel_index,
            generation = self.sweep_generation,
            live_entities = remaining,
            reclaimed_bytes = reclaimed,
            sweep_us = started.elapsed().as_micros() as u64,
            "sweep complete"
        );

        // gaps may have opened anywhere: re-check all files
        self.files.restart_file_cleanup_cursor();

        let channel_root_oid = self.cache.query_root_object_id(&self.arena);
        self.monitor.complete_sweep(self.channel_index, channel_root_oid)
    }

    fn delete_entity(&mut self, slot: Slot, type_index: usize, previous_in_type: Slot) {
        tracing::trace!(
            target: "marmot::cache",
            object_id = self.arena[slot].object_id(),
            "deleting entity"
        );
        // unindex first: unfindable by any future request
        self.cache.unregister_entity(self.arena[slot].object_id());
        // physical remains in the file become a gap
        self.files.remove_entity(&mut self.arena, slot);
        self.cache.types[type_index].remove(&mut self.arena, slot, previous_in_type);
        self.cache.ensure_no_cached_data(&mut self.arena, slot);
        self.arena[slot].set_deleted();
        self.arena.release(slot);
    }

    // -----------------------------------------------------------------
    // cache housekeeping
    // -----------------------------------------------------------------

    /// Budgeted eviction pass using the channel's configured evaluator.
    /// Returns `true` once the cache is empty or a full round-robin loop
    /// found nothing more to do before the deadline.
    pub fn incremental_entity_cache_check(&mut self, deadline: Instant) -> bool {
        let evaluator = Arc::clone(&self.evaluator);
        self.internal_cache_check(deadline, evaluator.as_ref())
    }

    /// Explicitly issued eviction pass, optionally with an override
    /// evaluator.
    pub fn issued_entity_cache_check(
        &mut self,
        deadline: Instant,
        evaluator: Option<&dyn EntityCacheEvaluator>,
    ) -> bool {
        match evaluator {
            Some(evaluator) => self.internal_cache_check(deadline, evaluator),
            None => self.incremental_entity_cache_check(deadline),
        }
    }

    /// Unconditionally evicts everything; returns the freed byte count.
    pub fn clear_cache(&mut self) -> u64 {
        self.cache.clear_cache(&mut self.arena)
    }

    fn internal_cache_check(
        &mut self,
        deadline: Instant,
        evaluator: &dyn EntityCacheEvaluator,
    ) -> bool {
        if self.cache.cache_size() == 0 {
            return true;
        }
        let evaluation_time = now_millis();

        // resolve the resumable cursor; restart when it went stale
        // (deleted or its slot reused by another entity)
        let cursor = match self.cache.live_cursor() {
            Some((slot, object_id))
                if self.arena[slot].is_proper()
                    && !self.arena[slot].is_deleted()
                    && self.arena[slot].object_id() == object_id =>
            {
                slot
            }
            _ => match self.files.first_entity(&self.arena) {
                Some(slot) => slot,
                // all files are effectively empty; nothing to check
                None => return true,
            },
        };

        let mut file_slot = self.arena[cursor].file_slot();
        let mut tail = self.files.tail_sentinel(file_slot);
        let mut entity = cursor;

        loop {
            if entity == tail {
                // end of one file reached; the last file connects back to
                // the first
                file_slot = self.files.ring_next(file_slot);
                tail = self.files.tail_sentinel(file_slot);
                entity = self.arena[self.files.head_sentinel(file_slot)].file_next;
                // the next file's first entry might be the cursor
                if entity == cursor || Instant::now() >= deadline {
                    break;
                }
                continue;
            }

            if self.entity_requires_cache_clearing(entity, evaluator, evaluation_time) {
                self.cache.ensure_no_cached_data(&mut self.arena, entity);
                // the last cached entity suspends the live check entirely
                if self.cache.cache_size() == 0 {
                    break;
                }
            }

            entity = self.arena[entity].file_next;
            if entity == cursor || Instant::now() >= deadline {
                break;
            }
        }

        self.quit_live_check(entity)
    }

    fn entity_requires_cache_clearing(
        &self,
        slot: Slot,
        evaluator: &dyn EntityCacheEvaluator,
        evaluation_time: i64,
    ) -> bool {
        if !self.arena[slot].is_live() {
            return false;
        }
        evaluator.clear_entity_cache(self.cache.cache_size(), evaluation_time, &self.arena[slot])
    }

    fn quit_live_check(&mut self, entity: Slot) -> bool {
        if self.cache.cache_size() == 0 {
            self.cache.set_live_cursor(None);
            tracing::trace!(
                target: "marmot::cache",
                channel = self.channel_index,
                "completed live check"
            );
            return true;
        }
        // keep the last checked entity as the next cycle's starting point
        let object_id = self.arena[entity].object_id();
        self.cache.set_live_cursor(Some((entity, object_id)));
        false
    }

    // -----------------------------------------------------------------
    // file housekeeping
    // -----------------------------------------------------------------

    /// Budgeted data file pass: deletes gap-only files, dissolves degraded
    /// files, retries deferred deletions. Returns `true` when the full
    /// ring was checked before the deadline.
    pub fn incremental_file_check(&mut self, deadline: Instant) -> Result<bool> {
        self.files.incremental_file_check(&mut self.arena, deadline)
    }

    /// One full housekeeping interval: GC, cache check and file check,
    /// each under its own configured budget. Returns whether every pass
    /// finished its work.
    pub fn housekeeping(&mut self, budgets: &HousekeepingConfig) -> Result<bool> {
        let gc_done = self.incremental_garbage_collection(
            Instant::now() + Duration::from_nanos(budgets.garbage_collection_budget_ns),
        )?;
        let cache_done = self.incremental_entity_cache_check(
            Instant::now() + Duration::from_nanos(budgets.cache_check_budget_ns),
        );
        let files_done = self.incremental_file_check(
            Instant::now() + Duration::from_nanos(budgets.file_check_budget_ns),
        )?;
        Ok(gc_done && cache_done && files_done)
    }

    // -----------------------------------------------------------------
    // initialization support
    // -----------------------------------------------------------------

    /// Walks all entities validating their lengths against their type
    /// handlers and reports the highest observed id per range plus the
    /// occurring type ids, consumed by the id-allocation subsystem.
    pub fn validate_entities(&self) -> Result<IdAnalysis> {
        self.cache.validate_entities(&self.arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfiguration;
    use crate::eviction::CacheEvaluator;
    use crate::io::{MemoryStorageIo, SequentialFileNumbers};
    use crate::types::test_support::{FixedTypeDictionary, FlatReferenceType};

    const ROOT_TID: ObjectId = 10;
    const NODE_TID: ObjectId = 20;
    const BLOB_TID: ObjectId = 30;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    fn test_channel(config: StorageConfiguration) -> StorageChannel {
        let monitor = Arc::new(
            MarkMonitor::new(
                config.channel_count,
                config.mark_queue_segment_capacity,
                config.reference_cache_length,
            )
            .unwrap(),
        );
        channel_for(0, &config, &monitor)
    }

    fn channel_for(
        index: usize,
        config: &StorageConfiguration,
        monitor: &Arc<MarkMonitor>,
    ) -> StorageChannel {
        let dictionary = FixedTypeDictionary::with(vec![
            Arc::new(FlatReferenceType::new(ROOT_TID, true)),
            Arc::new(FlatReferenceType::new(NODE_TID, true)),
            Arc::new(FlatReferenceType::new(BLOB_TID, false)),
        ]);
        StorageChannel::new(
            index,
            config,
            Arc::clone(monitor),
            dictionary,
            Arc::new(CacheEvaluator::from_config(&config.entity_cache).unwrap()),
            Arc::new(IgnoreZombieOids),
            Box::new(MemoryStorageIo::new()),
            Box::new(SequentialFileNumbers::default()),
        )
        .unwrap()
    }

    fn record(object_id: ObjectId, type_id: ObjectId, references: &[ObjectId]) -> EntityRecord {
        EntityRecord {
            object_id,
            type_id,
            data: FlatReferenceType::encode(references),
        }
    }

    fn store(channel: &mut StorageChannel, records: Vec<EntityRecord>) {
        channel.register_pending_store_update();
        channel.post_store_put_entities(records).unwrap();
    }

    fn config() -> StorageConfiguration {
        StorageConfiguration {
            root_type_id: ROOT_TID,
            ..StorageConfiguration::default()
        }
    }

    #[test]
    fn test_store_creates_and_caches_entities() {
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[1_000_000_002]),
                record(1_000_000_002, NODE_TID, &[]),
            ],
        );

        assert_eq!(channel.entity_count(), 2);
        assert_eq!(channel.is_entity_cached(1_000_000_001), Some(true));
        assert_eq!(channel.cache_size(), 8);
        // store data landed in the head file
        assert_eq!(channel.file_summaries()[0].data_length, 8);
    }

    #[test]
    fn test_store_update_leaves_gap() {
        let mut channel = test_channel(config());
        store(&mut channel, vec![record(1_000_000_002, NODE_TID, &[])]);
        store(
            &mut channel,
            vec![record(
                1_000_000_002,
                NODE_TID,
                &[1_000_000_004, 1_000_000_006],
            )],
        );

        assert_eq!(channel.entity_count(), 1);
        let summary = &channel.file_summaries()[0];
        // 0 bytes of the first version remain live, 16 of the second
        assert_eq!(summary.data_length, 16);
        assert_eq!(summary.total_length, 16);
        assert_eq!(channel.cache_size(), 16);
    }

    #[test]
    fn test_single_channel_mark_sweep_cycle() {
        // A -> B -> C live, D unreferenced
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[1_000_000_002]),
                record(1_000_000_002, NODE_TID, &[1_000_000_003]),
                record(1_000_000_003, NODE_TID, &[]),
                record(1_000_000_004, BLOB_TID, &[7]),
            ],
        );
        let live_before = channel.file_summaries()[0].data_length;

        // full hot + cold collection
        assert!(channel.issued_garbage_collection(far_deadline()).unwrap());

        assert!(channel.contains_entity(1_000_000_001));
        assert!(channel.contains_entity(1_000_000_002));
        assert!(channel.contains_entity(1_000_000_003));
        assert!(!channel.contains_entity(1_000_000_004));
        assert_eq!(channel.entity_count(), 3);

        // D's 8 bytes became a gap: live length dropped, total did not
        let summary = &channel.file_summaries()[0];
        assert_eq!(summary.data_length, live_before - 8);
        assert_eq!(summary.total_length, live_before);
        assert_eq!(channel.sweep_generation(), 2);
    }

    #[test]
    fn test_gc_reclaims_unreachable_graph() {
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[1_000_000_002]),
                record(1_000_000_002, NODE_TID, &[]),
                // unreachable cycle
                record(1_000_000_003, NODE_TID, &[1_000_000_004]),
                record(1_000_000_004, NODE_TID, &[1_000_000_003]),
            ],
        );

        assert!(channel.issued_garbage_collection(far_deadline()).unwrap());

        assert_eq!(channel.entity_count(), 2);
        assert!(!channel.contains_entity(1_000_000_003));
        assert!(!channel.contains_entity(1_000_000_004));
    }

    #[test]
    fn test_marking_loads_evicted_entities() {
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[1_000_000_002]),
                record(1_000_000_002, NODE_TID, &[1_000_000_003]),
                record(1_000_000_003, NODE_TID, &[]),
            ],
        );

        // evict everything, then collect: marking must load from the file
        assert!(channel.clear_cache() > 0);
        assert_eq!(channel.cache_size(), 0);

        assert!(channel.issued_garbage_collection(far_deadline()).unwrap());
        assert_eq!(channel.entity_count(), 3);
    }

    #[test]
    fn test_gc_is_idle_after_cold_completion() {
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![record(1_000_000_001, ROOT_TID, &[])],
        );
        assert!(channel.issued_garbage_collection(far_deadline()).unwrap());
        let generation = channel.sweep_generation();

        // no store in between: further GC calls are no-ops
        assert!(channel.incremental_garbage_collection(far_deadline()).unwrap());
        assert!(channel.issued_garbage_collection(far_deadline()).unwrap());
        assert_eq!(channel.sweep_generation(), generation);
    }

    #[test]
    fn test_issued_cache_check_with_override_evaluator() {
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[1_000_000_002]),
                record(1_000_000_002, BLOB_TID, &[1_000_000_009; 32]),
            ],
        );
        assert!(channel.cache_size() > 0);

        // the default evaluator keeps everything (fresh, tiny cache)
        assert!(!channel.incremental_entity_cache_check(far_deadline()));
        assert!(channel.cache_size() > 0);

        // an aggressive override clears the cache
        let evict_everything = CacheEvaluator::new(1, 1).unwrap();
        assert!(channel.issued_entity_cache_check(far_deadline(), Some(&evict_everything)));
        assert_eq!(channel.cache_size(), 0);
        assert_eq!(channel.is_entity_cached(1_000_000_002), Some(false));
        // the index entries persist after eviction
        assert_eq!(channel.entity_count(), 2);
    }

    #[test]
    fn test_id_analysis_after_stores() {
        let mut channel = test_channel(config());
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[]),
                record(1_000_000_777, NODE_TID, &[]),
                record(2_000_000, BLOB_TID, &[]),
            ],
        );

        let analysis = channel.validate_entities().unwrap();
        assert_eq!(analysis.highest_oid, 1_000_000_777);
        assert_eq!(analysis.highest_cid, 2_000_000);
        assert_eq!(analysis.highest_tid, BLOB_TID);
        assert_eq!(analysis.occurring_type_ids.len(), 3);
    }

    #[test]
    fn test_sweep_then_file_check_reclaims_space() {
        let mut config = config();
        // small files so the gap ratio degrades quickly
        config.data_files.file_minimum_size = 1024;
        config.data_files.file_maximum_size = 4096;
        let mut channel = test_channel(config);

        // root plus one large unreachable blob
        store(
            &mut channel,
            vec![
                record(1_000_000_001, ROOT_TID, &[1_000_000_002]),
                record(1_000_000_002, NODE_TID, &[]),
                record(1_000_000_004, BLOB_TID, &[0x42; 384]), // 3072 bytes
            ],
        );
        assert!(channel.issued_garbage_collection(far_deadline()).unwrap());
        assert!(!channel.contains_entity(1_000_000_004));

        // the blob's bytes linger as a gap until the file check runs
        let before: u64 = channel.file_summaries().iter().map(|s| s.total_length).sum();
        assert!(before >= 3072);
        assert!(channel.incremental_file_check(far_deadline()).unwrap());
        let after: u64 = channel.file_summaries().iter().map(|s| s.total_length).sum();
        assert!(after < before);

        // everything still reachable is intact
        assert!(channel.contains_entity(1_000_000_001));
        assert!(channel.contains_entity(1_000_000_002));
    }
}
