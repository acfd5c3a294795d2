//! Cache event observers
//!
//! Observers are plain closures registered with [`EventRegistry`]. An observer
//! whose delivery fails is unsubscribed on the spot.
//!
//! Observers run under the registry's read lock and must not subscribe or
//! unsubscribe from inside a delivery.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tessera_core::RemoveReason;
use tessera_datasource::DataSourceOperationResult;
use thiserror::Error;
use tracing::warn;

/// Something observers may want to know about
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    ItemAdded { key: String },
    ItemUpdated { key: String },
    ItemRemoved { key: String, reason: RemoveReason },
    /// Final result of a write-behind operation issued for a client
    WriteBehindCompleted {
        client_id: String,
        result: DataSourceOperationResult,
    },
    /// Clients should hold new writes for up to `timeout` while this node or
    /// a peer shuts down
    BlockActivity { timeout: Duration },
    /// The hold is lifted
    UnblockActivity,
    CacheStopped,
}

/// Returned by an observer that could not take the event
#[derive(Debug, Error)]
#[error("listener failed: {0}")]
pub struct ListenerError(pub String);

impl ListenerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Observer = Box<dyn Fn(&CacheEvent) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Default)]
pub struct EventRegistry {
    observers: RwLock<Vec<(SubscriptionId, Observer)>>,
    next_id: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, observer: F) -> SubscriptionId
    where
        F: Fn(&CacheEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, Box::new(observer)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(sid, _)| *sid != id);
        observers.len() != before
    }

    pub fn len(&self) -> usize {
        self.observers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every observer. Returns how many accepted it.
    pub fn publish(&self, event: &CacheEvent) -> usize {
        let mut failed = Vec::new();
        let delivered = {
            let observers = self.observers.read();
            let mut delivered = 0;
            for (id, observer) in observers.iter() {
                match observer(event) {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        warn!(target: "tessera::store", subscription = id.0, error = %e, "Removing failed observer");
                        failed.push(*id);
                    }
                }
            }
            delivered
        };

        if !failed.is_empty() {
            self.observers.write().retain(|(id, _)| !failed.contains(id));
        }
        delivered
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("observers", &self.len())
            .finish()
    }
}
