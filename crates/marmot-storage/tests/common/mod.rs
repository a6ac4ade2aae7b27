//! Shared scaffolding for the storage integration tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use marmot_storage::channel::{EntityRecord, IgnoreZombieOids, StorageChannel};
use marmot_storage::config::StorageConfiguration;
use marmot_storage::eviction::CacheEvaluator;
use marmot_storage::io::{MemoryStorageIo, SequentialFileNumbers};
use marmot_storage::mark_monitor::MarkMonitor;
use marmot_storage::oid::ObjectId;
use marmot_storage::types::{TypeDictionary, TypeHandler};

pub const ROOT_TID: ObjectId = 10;
pub const NODE_TID: ObjectId = 20;
pub const BLOB_TID: ObjectId = 30;

/// Handler whose entity data is a flat sequence of little-endian u64
/// reference ids.
pub struct FlatReferenceType {
    type_id: ObjectId,
    has_references: bool,
}

impl FlatReferenceType {
    pub fn new(type_id: ObjectId, has_references: bool) -> Self {
        Self {
            type_id,
            has_references,
        }
    }
}

impl TypeHandler for FlatReferenceType {
    fn type_id(&self) -> ObjectId {
        self.type_id
    }

    fn has_references(&self) -> bool {
        self.has_references
    }

    fn minimum_length(&self) -> u64 {
        0
    }

    fn maximum_length(&self) -> u64 {
        u64::MAX
    }

    fn iterate_references(&self, data: &[u8], visitor: &mut dyn FnMut(ObjectId)) {
        if !self.has_references {
            return;
        }
        for chunk in data.chunks_exact(8) {
            visitor(u64::from_le_bytes(chunk.try_into().unwrap()));
        }
    }
}

pub struct FixedTypeDictionary {
    handlers: Vec<Arc<dyn TypeHandler>>,
}

impl TypeDictionary for FixedTypeDictionary {
    fn lookup_type_handler(&self, type_id: ObjectId) -> Option<Arc<dyn TypeHandler>> {
        self.handlers
            .iter()
            .find(|handler| handler.type_id() == type_id)
            .cloned()
    }
}

pub fn dictionary() -> Arc<FixedTypeDictionary> {
    Arc::new(FixedTypeDictionary {
        handlers: vec![
            Arc::new(FlatReferenceType::new(ROOT_TID, true)),
            Arc::new(FlatReferenceType::new(NODE_TID, true)),
            Arc::new(FlatReferenceType::new(BLOB_TID, false)),
        ],
    })
}

pub fn encode_references(references: &[ObjectId]) -> Vec<u8> {
    let mut data = Vec::with_capacity(references.len() * 8);
    for oid in references {
        data.extend_from_slice(&oid.to_le_bytes());
    }
    data
}

pub fn record(object_id: ObjectId, type_id: ObjectId, references: &[ObjectId]) -> EntityRecord {
    EntityRecord {
        object_id,
        type_id,
        data: encode_references(references),
    }
}

pub fn configuration(channel_count: usize) -> StorageConfiguration {
    StorageConfiguration {
        channel_count,
        root_type_id: ROOT_TID,
        ..StorageConfiguration::default()
    }
}

/// Builds the monitor plus one channel per shard, all over in-memory I/O.
pub fn build_storage(config: &StorageConfiguration) -> (Arc<MarkMonitor>, Vec<StorageChannel>) {
    let monitor = Arc::new(
        MarkMonitor::new(
            config.channel_count,
            config.mark_queue_segment_capacity,
            config.reference_cache_length,
        )
        .unwrap(),
    );
    let channels = (0..config.channel_count)
        .map(|index| {
            StorageChannel::new(
                index,
                config,
                Arc::clone(&monitor),
                dictionary(),
                Arc::new(CacheEvaluator::from_config(&config.entity_cache).unwrap()),
                Arc::new(IgnoreZombieOids),
                Box::new(MemoryStorageIo::new()),
                Box::new(SequentialFileNumbers::default()),
            )
            .unwrap()
        })
        .collect();
    (monitor, channels)
}

/// Routes records to their owning channels and stores them under the
/// pending-store protocol.
pub fn store(channels: &mut [StorageChannel], records: Vec<EntityRecord>) {
    let modulo = channels.len() as u64 - 1;
    let mut per_channel: Vec<Vec<EntityRecord>> = (0..channels.len()).map(|_| Vec::new()).collect();
    for record in records {
        per_channel[(record.object_id & modulo) as usize].push(record);
    }
    for (index, records) in per_channel.into_iter().enumerate() {
        if records.is_empty() {
            continue;
        }
        channels[index].register_pending_store_update();
        channels[index].post_store_put_entities(records).unwrap();
    }
}

pub fn far_deadline() -> Instant {
    Instant::now() + Duration::from_secs(3600)
}

/// Drives all channels round-robin until the GC reports completion for
/// every one of them (or panics after too many rounds).
pub fn run_gc_to_completion(monitor: &MarkMonitor, channels: &mut [StorageChannel]) {
    for _ in 0..10_000 {
        let mut all_complete = true;
        for channel in channels.iter_mut() {
            channel
                .incremental_garbage_collection(far_deadline())
                .unwrap();
            if !monitor.is_complete(channel.channel_index()) {
                all_complete = false;
            }
        }
        if all_complete {
            return;
        }
    }
    panic!("garbage collection did not converge");
}
