//! Cache engine for Tessera
//!
//! This crate ties the lower layers together behind [`EntryStore`]:
//! - store: the facade and its write pipeline (admission, storage, cascade, backing source)
//! - shutdown: graceful stop latch and drain
//! - cascade: removal of dependents after a key is replaced or removed
//! - config: `tessera.toml`
//! - stats / events: counters and observer registry
//! - pool: thread-local entry shells
//! - cleaner: background expiration
//!
//! The engine is the only component that knows about:
//! - Node lifecycle (start, graceful and forced stop)
//! - Cross-layer coordination (storage + data source + client ledger)

#![warn(clippy::all)]

pub mod cascade;
pub mod cleaner;
pub mod config;
pub mod events;
pub mod features;
pub mod pool;
pub mod shutdown;
pub mod stats;
pub mod store;

pub use cascade::{CascadeDependencyResolver, CascadeReport};
pub use cleaner::{ExpirationCleaner, ExpirySweep};
pub use config::{CacheConfig, Topology, CONFIG_FILE_NAME};
pub use events::{CacheEvent, EventRegistry, ListenerError, SubscriptionId};
pub use features::{Feature, FeatureGate};
pub use pool::EntryPool;
pub use shutdown::{ShutdownCoordinator, ShutdownHooks, ShutdownStatus};
pub use stats::{CacheStats, StatsSnapshot};
pub use store::{
    AddOptions, BulkOutcome, EntryMeta, EntryStore, EntryStoreBuilder, EntryView, GetOptions,
    InsertOptions, LockResult, RemoveOptions,
};

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;

    assert_impl_all!(EntryStore: Send, Sync, Clone);
    assert_impl_all!(ShutdownCoordinator: Send, Sync);
    assert_impl_all!(EventRegistry: Send, Sync);
    assert_impl_all!(CacheStats: Send, Sync);
}
