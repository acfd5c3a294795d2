//! Tessera - per-node coordination core of a distributed in-memory cache
//!
//! Tessera sits between client requests and the node's keyed storage. It
//! decides, for every mutation, whether the caller may proceed (locks,
//! versions, shutdown admission), which dependent entries must go with it,
//! and how the change reaches an external backing store.
//!
//! # Quick Start
//!
//! ```ignore
//! use tessera::{CacheConfig, EntryStore, InsertOptions};
//!
//! let store = EntryStore::builder(CacheConfig::default()).build()?;
//! store.start()?;
//!
//! let version = store.insert("user:123", "Alice", InsertOptions::default())?;
//! assert_eq!(store.get("user:123")?, Some("Alice".into()));
//!
//! store.stop(true)?;
//! ```
//!
//! # Architecture
//!
//! [`EntryStore`] is the facade. The layers underneath are re-exported for
//! embedders that bring their own storage engine, provider or scheduler.

pub use tessera_engine::*;

pub use tessera_cluster as cluster;
pub use tessera_concurrency as concurrency;
pub use tessera_datasource as datasource;
pub use tessera_storage as storage;

pub use tessera_core::{
    AccessType, CacheEntry, CacheError, CacheImpl, CancellationToken, EntryFlags,
    ExpirationHint, GroupInfo, KeyDependency, LockId, LockRequest, LockState, OperationContext,
    RemoveReason, Result, StatsCollector, Timestamp, Value,
};
