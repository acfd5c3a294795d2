//! Backing data source synchronization for Tessera
//!
//! After a local mutation commits, the engine may push it to an external data
//! source. This crate provides:
//!
//! - [`DataSourceProvider`]: the contract a backing store implements
//! - [`DataSourceManager`]: provider registry, write-through and read-through calls
//! - [`WriteBehindQueue`]: asynchronous execution with bounded retry and
//!   completion tickets
//! - [`DataSourceSyncPipeline`]: the post-commit step the facade drives

#![warn(clippy::all)]

pub mod manager;
pub mod operation;
pub mod pipeline;
pub mod provider;
pub mod queue;
pub mod retry;

pub use manager::{DataSourceManager, DataSourceOptions};
pub use operation::{DataSourceOperationResult, OperationStatus, WriteOperation, WriteOperationKind};
pub use pipeline::{DataSourceSyncPipeline, NodeRole, SyncResult, WriteBehindForwarder};
pub use provider::{DataSourceProvider, ProviderError, ProviderRegistry};
pub use queue::{CompletionHook, QueueStats, WriteBehindQueue, WriteBehindTicket};
pub use retry::RetryPolicy;

#[cfg(test)]
mod send_sync {
    use super::*;
    static_assertions::assert_impl_all!(DataSourceManager: Send, Sync);
    static_assertions::assert_impl_all!(DataSourceSyncPipeline: Send, Sync);
    static_assertions::assert_impl_all!(WriteBehindQueue: Send, Sync);
}
