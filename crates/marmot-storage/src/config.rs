//! Storage configuration.
//!
//! Plain data with explicit validation. Defaults mirror a medium-sized
//! deployment: one day of cache timeout, ~1 GB abstract cache threshold,
//! 1 MiB / 8 MiB data file bounds and a 75% minimum fill ratio.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StorageError};
use crate::oid::{self, ObjectId};

/// Entity cache eviction parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityCacheConfig {
    /// Age in milliseconds after which cached entity data is always cleared.
    pub timeout_ms: i64,
    /// Abstract threshold relating cache fullness to entity weight.
    pub threshold: i64,
}

impl Default for EntityCacheConfig {
    fn default() -> Self {
        Self {
            // one day of not being read
            timeout_ms: 86_400_000,
            // ~1 GB
            threshold: 1_000_000_000,
        }
    }
}

/// Data file retirement and consolidation parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataFileConfig {
    /// Minimum file size in bytes; smaller non-head files are dissolved.
    pub file_minimum_size: u64,
    /// Maximum file size in bytes; a file reaching it is retired.
    pub file_maximum_size: u64,
    /// Minimum live/total byte ratio below which a file becomes a dissolve candidate.
    pub minimum_use_ratio: f64,
    /// Whether the current head file may itself be dissolved.
    pub cleanup_head_file: bool,
}

impl Default for DataFileConfig {
    fn default() -> Self {
        Self {
            file_minimum_size: 1024 * 1024,
            file_maximum_size: 8 * 1024 * 1024,
            minimum_use_ratio: 0.75,
            cleanup_head_file: true,
        }
    }
}

/// Nanosecond time budgets per housekeeping interval.
///
/// The interval scheduling itself lives outside this core; channels only
/// consume the budgets, performing work opportunistically between request
/// slices and yielding once a budget is exhausted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Budget per garbage collection pass.
    pub garbage_collection_budget_ns: u64,
    /// Budget per entity cache check pass.
    pub cache_check_budget_ns: u64,
    /// Budget per data file check pass.
    pub file_check_budget_ns: u64,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            garbage_collection_budget_ns: 10_000_000,
            cache_check_budget_ns: 10_000_000,
            file_check_budget_ns: 10_000_000,
        }
    }
}

/// Top-level configuration for the storage core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfiguration {
    /// Number of channels (hash partitions). Power of two, at most 64.
    pub channel_count: usize,
    /// Type id grouping the root entities each mark epoch is seeded from.
    pub root_type_id: ObjectId,
    /// Entity cache eviction parameters.
    pub entity_cache: EntityCacheConfig,
    /// Data file lifecycle parameters.
    pub data_files: DataFileConfig,
    /// Housekeeping time budgets.
    pub housekeeping: HousekeepingConfig,
    /// Oids fetched from the mark queue per marking batch.
    pub marking_buffer_length: usize,
    /// Bounded wait per round when blocking for cross-channel mark work.
    pub marking_wait_ms: u64,
    /// Per-target-channel buffer length of the reference batcher.
    pub reference_cache_length: usize,
    /// Capacity of one mark queue segment.
    pub mark_queue_segment_capacity: usize,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            channel_count: 1,
            root_type_id: 1,
            entity_cache: EntityCacheConfig::default(),
            data_files: DataFileConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            marking_buffer_length: 10_000,
            marking_wait_ms: 100,
            reference_cache_length: 100,
            mark_queue_segment_capacity: 500,
        }
    }
}

impl StorageConfiguration {
    /// Validates all values, returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        if !oid::is_valid_channel_count(self.channel_count) {
            return Err(StorageError::Configuration(format!(
                "channel count {} must be a power of two in [1, {}]",
                self.channel_count,
                oid::MAX_CHANNEL_COUNT
            )));
        }
        if self.root_type_id == oid::NULL_OBJECT_ID {
            return Err(StorageError::Configuration(
                "root type id must not be the null id".into(),
            ));
        }
        if self.entity_cache.timeout_ms < 1 {
            return Err(StorageError::Configuration(format!(
                "cache timeout of {} ms is lower than the minimum value 1",
                self.entity_cache.timeout_ms
            )));
        }
        if self.entity_cache.threshold < 1 {
            return Err(StorageError::Configuration(format!(
                "cache threshold of {} is lower than the minimum value 1",
                self.entity_cache.threshold
            )));
        }
        let files = &self.data_files;
        if files.file_minimum_size < 1024 {
            return Err(StorageError::Configuration(format!(
                "file minimum size of {} is lower than the minimum value 1024",
                files.file_minimum_size
            )));
        }
        if files.file_maximum_size < files.file_minimum_size + 1024 {
            return Err(StorageError::Configuration(format!(
                "file maximum size of {} must exceed the minimum size {} by at least 1024",
                files.file_maximum_size, files.file_minimum_size
            )));
        }
        if !(files.minimum_use_ratio > 0.0 && files.minimum_use_ratio <= 1.0) {
            return Err(StorageError::Configuration(format!(
                "minimum use ratio of {} is not in the valid range ]0.0, 1.0]",
                files.minimum_use_ratio
            )));
        }
        if self.marking_buffer_length == 0 {
            return Err(StorageError::Configuration(
                "marking buffer length must be positive".into(),
            ));
        }
        if self.marking_wait_ms == 0 {
            return Err(StorageError::Configuration(
                "marking wait time must be positive".into(),
            ));
        }
        if self.reference_cache_length == 0 {
            return Err(StorageError::Configuration(
                "reference cache length must be positive".into(),
            ));
        }
        if self.mark_queue_segment_capacity == 0 {
            return Err(StorageError::Configuration(
                "mark queue segment capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// `channel_count - 1`, the oid ownership mask.
    pub fn channel_hash_modulo(&self) -> u64 {
        self.channel_count as u64 - 1
    }
}
