//! Core types and contracts for Tessera
//!
//! This crate defines the foundational types used throughout the system:
//! - CacheEntry: the stored item with version, lock, group, flags and hints
//! - Value: cached payload
//! - Timestamp: microsecond wall-clock time
//! - OperationOutcome / AccessType: results and knobs of write paths
//! - CacheError: error taxonomy
//! - CacheImpl / StatsCollector: collaborator traits

#![warn(clippy::all)]

pub mod context;
pub mod entry;
pub mod error;
pub mod outcome;
pub mod timestamp;
pub mod traits;
pub mod value;

pub use context::{CancellationToken, OperationContext};
pub use entry::{
    CacheEntry, DataSourceMode, EntryFlags, EvictionHint, EvictionPriority, ExpirationHint,
    GroupInfo, KeyDependency, LockId, LockState, QueryInfo, SyncDependency,
};
pub use error::{BoxError, CacheError, Result};
pub use outcome::{AccessType, OperationOutcome, OperationType, RemoveReason};
pub use timestamp::Timestamp;
pub use traits::{CacheImpl, LockRequest, NoopStats, ReadResult, StatsCollector, WriteResult};
pub use value::Value;
