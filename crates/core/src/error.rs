//! Error types for the cache coordination core
//!
//! Every layer reports failures through [`CacheError`]. Expected contention
//! (`ItemLocked`, `VersionMismatch`, `KeyExists`, `IncompatibleGroup`) is surfaced
//! as-is and never retried here; anything unexpected coming out of a collaborator
//! is wrapped as `OperationFailed` with the original cause attached.

use crate::outcome::OperationOutcome;
use thiserror::Error;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Boxed cause carried by `OperationFailed`
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error taxonomy of the coordination core
#[derive(Debug, Error)]
pub enum CacheError {
    /// Generic failure, wrapping the underlying cause when there is one
    #[error("Operation failed: {message}")]
    OperationFailed {
        /// Human-readable context
        message: String,
        /// Underlying cause
        #[source]
        source: Option<BoxError>,
    },

    /// Another caller holds a valid lock on the key
    #[error("Item is locked: {key}")]
    ItemLocked {
        /// Contended key
        key: String,
    },

    /// A version precondition did not hold
    #[error("Version mismatch for key {key}")]
    VersionMismatch {
        /// Key whose version did not match
        key: String,
    },

    /// Add on an existing key
    #[error("The specified key already exists: {key}")]
    KeyExists {
        /// Existing key
        key: String,
    },

    /// Write would move an entry into a different data group
    #[error("Data group of the inserted item does not match the existing item's data group: {key}")]
    IncompatibleGroup {
        /// Key carrying the conflicting group
        key: String,
    },

    /// A declared key dependency does not exist
    #[error("One of the dependency keys does not exist: {key}")]
    DependencyKeyNotFound {
        /// Key whose dependency could not be satisfied
        key: String,
    },

    /// Cache is full and eviction could not make enough room
    #[error("The cache is full and not enough items could be evicted")]
    EvictionExhausted,

    /// Write/read-through requested but no usable provider is configured
    #[error("Backing source not available: {reason}")]
    BackingSourceUnavailable {
        /// Why the provider cannot be used
        reason: String,
    },

    /// A cancellation token was observed
    #[error("Operation canceled")]
    OperationCanceled,

    /// Transient cluster condition, propagated unchanged
    #[error("State transfer in progress")]
    StateTransferInProgress,

    /// The cache has been stopped
    #[error("Cache is not running")]
    NotRunning,

    /// Caller supplied an invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be read or is invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl CacheError {
    /// `OperationFailed` without an inner cause
    pub fn operation_failed(message: impl Into<String>) -> Self {
        CacheError::OperationFailed {
            message: message.into(),
            source: None,
        }
    }

    /// `OperationFailed` preserving `cause`
    pub fn wrap<E>(message: impl Into<String>, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CacheError::OperationFailed {
            message: message.into(),
            source: Some(Box::new(cause)),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        CacheError::InvalidArgument(message.into())
    }

    pub fn backing_source_unavailable(reason: impl Into<String>) -> Self {
        CacheError::BackingSourceUnavailable {
            reason: reason.into(),
        }
    }

    /// Map a write outcome to the error the facade surfaces for it.
    ///
    /// Returns `None` for successes and for `Failure`, which the facade treats
    /// as a silent no-op.
    pub fn from_outcome(key: &str, outcome: OperationOutcome) -> Option<Self> {
        let key = key.to_string();
        match outcome {
            OperationOutcome::Success
            | OperationOutcome::SuccessOverwrite { .. }
            | OperationOutcome::Failure => None,
            OperationOutcome::NeedsEviction => Some(CacheError::EvictionExhausted),
            OperationOutcome::KeyExists => Some(CacheError::KeyExists { key }),
            OperationOutcome::ItemLocked => Some(CacheError::ItemLocked { key }),
            OperationOutcome::VersionMismatch => Some(CacheError::VersionMismatch { key }),
            OperationOutcome::IncompatibleGroup => Some(CacheError::IncompatibleGroup { key }),
            OperationOutcome::DependencyKeyNotExist => {
                Some(CacheError::DependencyKeyNotFound { key })
            }
        }
    }

    /// Expected contention between callers, as opposed to a fault
    pub fn is_contention(&self) -> bool {
        matches!(
            self,
            CacheError::ItemLocked { .. }
                | CacheError::VersionMismatch { .. }
                | CacheError::KeyExists { .. }
                | CacheError::IncompatibleGroup { .. }
        )
    }
}
