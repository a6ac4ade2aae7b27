//! Storage error types.
//!
//! Consistency violations are fatal to the owning channel: the channel must
//! stop processing and surface the error, since continuing risks premature
//! reclamation or unbounded growth. Budget exhaustion is never an error, and
//! zombie object ids route through the pluggable policy instead of this enum.

use crate::io::FileIdentity;
use crate::oid::ObjectId;

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by the storage core.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Internal bookkeeping no longer adds up. Fatal to the owning channel.
    #[error("channel {channel}: consistency violation: {detail}")]
    Consistency {
        /// Index of the channel that detected the violation.
        channel: usize,
        /// Human-readable description of the inconsistency.
        detail: String,
    },

    /// An object id hashed to a different channel than the one processing it.
    #[error("invalid object id {object_id} for hash channel {channel}")]
    InvalidObjectIdChannel {
        /// The offending object id.
        object_id: ObjectId,
        /// The channel that received it.
        channel: usize,
    },

    /// An object id is already registered with a different type.
    #[error(
        "object id {object_id} already assigned to an entity of type {existing_type_id}, \
         store requested type {requested_type_id}"
    )]
    TypeMismatch {
        /// The offending object id.
        object_id: ObjectId,
        /// Type the entity is registered under.
        existing_type_id: ObjectId,
        /// Type the store attempted to assign.
        requested_type_id: ObjectId,
    },

    /// An entity failed the type handler's structural validation.
    #[error("entity {object_id} of type {type_id} has invalid length {length}")]
    InvalidEntityLength {
        /// The offending object id.
        object_id: ObjectId,
        /// The entity's type id.
        type_id: ObjectId,
        /// The rejected data length.
        length: u64,
    },

    /// No type handler is registered for a stored type id.
    #[error("no type handler registered for type id {type_id}")]
    UnknownType {
        /// The unresolvable type id.
        type_id: ObjectId,
    },

    /// A configuration value is outside its valid range.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An I/O operation on a data file failed.
    #[error("i/o failure on data file {identity}: {source}")]
    Io {
        /// Identity of the file the operation targeted.
        identity: FileIdentity,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn consistency(channel: usize, detail: impl Into<String>) -> Self {
        StorageError::Consistency {
            channel,
            detail: detail.into(),
        }
    }

    /// Whether this error is fatal to the channel that raised it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::Consistency { .. }
                | StorageError::InvalidObjectIdChannel { .. }
                | StorageError::TypeMismatch { .. }
        )
    }
}
