//! Entity cache eviction.
//!
//! Evaluators decide whether a live entity's cached data shall be unloaded.
//! An evaluator must be safe enough to never panic: it runs on the channel
//! thread for every cached entity, and a panic there dooms the channel.
//! Implementations should stick to plain (wrapping) arithmetic.

use crate::config::EntityCacheConfig;
use crate::entity::Entity;
use crate::error::{Result, StorageError};

/// Decides if a live entity's cached data shall be cleared.
pub trait EntityCacheEvaluator: Send + Sync {
    /// `true` if the entity's cached data shall be unloaded now.
    ///
    /// `total_cache_size` is the channel's current cache usage in bytes,
    /// `evaluation_time_ms` the (signed) millisecond timestamp of this pass.
    fn clear_entity_cache(
        &self,
        total_cache_size: u64,
        evaluation_time_ms: i64,
        entity: &Entity,
    ) -> bool;

    /// Whether a freshly loaded entity's data shall be cached at all.
    fn initially_cache_entity(
        &self,
        total_cache_size: u64,
        evaluation_time_ms: i64,
        entity: &Entity,
    ) -> bool {
        !self.clear_entity_cache(total_cache_size, evaluation_time_ms, entity)
    }
}

/// Shifting the age by 16 roughly equals age in minutes and is fast.
const AGE_SHIFT: u32 = 16;

/// Default weight-based evaluator.
///
/// An entity is evicted once its age reaches the timeout, or once its
/// "weight" (cached length, scaled by age, doubled for reference-free
/// entities) exceeds the cache's remaining abstract headroom
/// (`threshold - total_cache_size`). Shrinking headroom makes eviction
/// progressively more aggressive; a fully idle system eventually evicts
/// everything, bounding memory without explicit LRU bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEvaluator {
    timeout_ms: i64,
    threshold: i64,
}

impl CacheEvaluator {
    /// Creates an evaluator, validating both values to be at least 1.
    pub fn new(timeout_ms: i64, threshold: i64) -> Result<Self> {
        if timeout_ms < 1 {
            return Err(StorageError::Configuration(format!(
                "cache timeout of {timeout_ms} ms is lower than the minimum value 1"
            )));
        }
        if threshold < 1 {
            return Err(StorageError::Configuration(format!(
                "cache threshold of {threshold} is lower than the minimum value 1"
            )));
        }
        Ok(Self {
            timeout_ms,
            threshold,
        })
    }

    /// Builds the evaluator from a validated configuration section.
    pub fn from_config(config: &EntityCacheConfig) -> Result<Self> {
        Self::new(config.timeout_ms, config.threshold)
    }

    /// Age timeout in milliseconds.
    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    /// Abstract cache threshold.
    pub fn threshold(&self) -> i64 {
        self.threshold
    }
}

impl Default for CacheEvaluator {
    fn default() -> Self {
        let config = EntityCacheConfig::default();
        Self {
            timeout_ms: config.timeout_ms,
            threshold: config.threshold,
        }
    }
}

impl EntityCacheEvaluator for CacheEvaluator {
    fn clear_entity_cache(
        &self,
        total_cache_size: u64,
        evaluation_time_ms: i64,
        entity: &Entity,
    ) -> bool {
        // Entities touched "in the future" have a negative age; the shift
        // must stay signed or such an age becomes a giant positive weight
        // and causes an unwanted unload.
        let age_ms = evaluation_time_ms.wrapping_sub(entity.last_touched());
        if age_ms >= self.timeout_ms {
            return true;
        }

        // Reference-free entities tend to be huge blobs the GC never needs,
        // so their weight is doubled.
        let weight = (entity.cached_data_length() as i64)
            .wrapping_mul(age_ms >> AGE_SHIFT)
            .wrapping_shl(if entity.has_references() { 0 } else { 1 });

        self.threshold.wrapping_sub(total_cache_size as i64) < weight
    }
}
