//! Results of write paths and the knobs callers use to steer them

use serde::{Deserialize, Serialize};

/// Outcome produced by every storage write path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// New key written
    Success,
    /// Existing key replaced
    SuccessOverwrite {
        /// Version of the entry that was replaced
        previous_version: u64,
    },
    /// Nothing happened (e.g. removing a key that does not exist)
    Failure,
    /// The store is full and could not make room
    NeedsEviction,
    /// Add on a key that already exists
    KeyExists,
    /// Another holder owns a valid lock on the key
    ItemLocked,
    /// A version precondition did not hold
    VersionMismatch,
    /// Existing entry belongs to a different data group
    IncompatibleGroup,
    /// A declared key dependency points at a missing key
    DependencyKeyNotExist,
}

impl OperationOutcome {
    /// Whether the local write committed
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            OperationOutcome::Success | OperationOutcome::SuccessOverwrite { .. }
        )
    }

    pub fn previous_version(&self) -> Option<u64> {
        match self {
            OperationOutcome::SuccessOverwrite { previous_version } => Some(*previous_version),
            _ => None,
        }
    }
}

/// How an operation interacts with the key's lock and version
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccessType {
    /// Proceed regardless of any lock
    #[default]
    IgnoreLock,
    /// Acquire the lock if free (or expired) and proceed
    Acquire,
    /// Proceed only if unlocked or the caller holds the current lock
    DontAcquire,
    /// Proceed only if the stored version equals the requested version
    PreserveVersion,
}

/// Why an entry left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoveReason {
    /// Explicit remove/delete by a caller
    Removed,
    /// A key it depended on was removed or replaced
    DependencyChanged,
    /// Its expiration hint elapsed
    Expired,
    /// Evicted to make room
    Evicted,
}

/// Operation class used by shutdown admission checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Read,
    Add,
    Insert,
    Remove,
    Lock,
}

impl OperationType {
    pub fn is_write(&self) -> bool {
        !matches!(self, OperationType::Read)
    }
}
