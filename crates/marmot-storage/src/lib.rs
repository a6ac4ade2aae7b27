//! # Marmot Storage Core
//!
//! Channel-sharded entity storage with a concurrent mark-sweep garbage
//! collector.
//!
//! ## Design
//!
//! - **Channels**: the object-id space is hash-partitioned; every channel
//!   owns one shard (entities, cache, data files) and is driven by exactly
//!   one thread. Channels share nothing but the coordination primitives.
//! - **Tri-color marking**: each channel drains its own mark queue and
//!   routes discovered reference ids to the owning channels' queues.
//! - **Phase convergence without stop-the-world**: the mark monitor flips
//!   all channels into sweep mode once marking is globally complete; two
//!   consecutive quiet cycles (hot, then cold) put the GC fully to sleep
//!   until the next store.
//! - **Bounded housekeeping**: GC, cache eviction and file consolidation
//!   run opportunistically under caller-supplied nanosecond budgets.

pub mod channel;
pub mod config;
pub mod data_file;
pub mod entity;
mod entity_cache;
pub mod error;
pub mod eviction;
pub mod io;
pub mod mark_monitor;
pub mod mark_queue;
pub mod oid;
pub mod types;

pub use channel::{EntityRecord, IgnoreZombieOids, StorageChannel, ZombieOidHandler};
pub use config::{
    DataFileConfig, EntityCacheConfig, HousekeepingConfig, StorageConfiguration,
};
pub use data_file::{DataFileEvaluator, FileSummary, FileUsage};
pub use entity::{Entity, GcColor};
pub use error::{Result, StorageError};
pub use eviction::{CacheEvaluator, EntityCacheEvaluator};
pub use io::{
    FileIdentity, FileNumberProvider, MemoryStorageIo, SequentialFileNumbers, StorageIo,
};
pub use mark_monitor::{MarkMonitor, ReferenceMarker};
pub use mark_queue::MarkQueue;
pub use oid::{IdAnalysis, NULL_OBJECT_ID, ObjectId};
pub use types::{TypeDictionary, TypeHandler};
