//! EntryStore: the per-node cache facade
//!
//! Every public write runs the same pipeline:
//!
//! 1. backing-source precondition (fail fast before anything is touched)
//! 2. shutdown admission
//! 3. the storage write, where lock and version rules are evaluated
//! 4. statistics and events
//! 5. cascade removal of dependents of the replaced or removed entry
//! 6. write-through or write-behind of the root mutation only
//!
//! Unexpected collaborator failures are logged once here and surfaced as
//! `OperationFailed`; contention outcomes come back as their typed errors.

mod builder;
mod bulk;
mod options;

pub use builder::EntryStoreBuilder;
pub use options::{
    AddOptions, BulkOutcome, EntryMeta, EntryView, GetOptions, InsertOptions, LockResult,
    RemoveOptions,
};

use crate::cascade::{CascadeDependencyResolver, CascadeReport};
use crate::cleaner::{ExpirationCleaner, ExpirySweep};
use crate::config::CacheConfig;
use crate::events::{CacheEvent, EventRegistry};
use crate::features::{Feature, FeatureGate};
use crate::pool::EntryPool;
use crate::shutdown::{InFlightGuard, ShutdownCoordinator, ShutdownHooks, ShutdownStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessera_cluster::{ClientInfo, ConnectOutcome, ConnectedClientsLedger, NodeAddress};
use tessera_concurrency::LockIdGenerator;
use tessera_core::{
    AccessType, CacheEntry, CacheError, CacheImpl, DataSourceMode, EntryFlags, LockId,
    LockState, OperationContext, OperationOutcome, OperationType, RemoveReason, Result,
    StatsCollector, Timestamp, Value, WriteResult,
};
use tessera_datasource::{
    DataSourceSyncPipeline, OperationStatus, SyncResult, WriteOperation, WriteOperationKind,
};
use tracing::{debug, error, info, warn};

/// Per-node cache facade
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct EntryStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    config: CacheConfig,
    storage: Arc<dyn CacheImpl>,
    lock_ids: LockIdGenerator,
    cascade: CascadeDependencyResolver,
    pipeline: DataSourceSyncPipeline,
    shutdown: ShutdownCoordinator,
    ledger: Arc<ConnectedClientsLedger>,
    events: Arc<EventRegistry>,
    stats: Arc<dyn StatsCollector>,
    features: FeatureGate,
    cleaner: Mutex<Option<ExpirationCleaner>>,
    running: AtomicBool,
}

impl EntryStore {
    pub fn builder(config: CacheConfig) -> EntryStoreBuilder {
        EntryStoreBuilder::new(config)
    }

    pub(crate) fn from_inner(inner: StoreInner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start serving. Restarting a stopped store resets the shutdown latch.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.reset();

        let target: Arc<dyn ExpirySweep> = self.inner.clone();
        let weak: Weak<dyn ExpirySweep> = Arc::downgrade(&target);
        let cleaner = ExpirationCleaner::start(weak, self.inner.config.expiry_interval())?;
        *self.inner.cleaner.lock() = Some(cleaner);

        self.inner.running.store(true, Ordering::SeqCst);
        info!(target: "tessera::store", name = %self.inner.config.name, "Cache started");
        Ok(())
    }

    /// Stop the cache.
    ///
    /// A graceful stop returns immediately and drains in the background; use
    /// [`EntryStore::wait_for_shutdown`] to wait for it. A forced stop cancels
    /// any graceful stop in progress and takes effect before returning.
    ///
    /// Either way, write-behind operations still queued once the store halts
    /// are dropped and complete as `FailureRetry`. Worker and scheduler
    /// threads stay up so the store can be started again; they exit when the
    /// store is dropped.
    pub fn stop(&self, graceful: bool) -> Result<()> {
        if graceful {
            if !self.is_running() {
                return Ok(());
            }
            let hooks: Arc<dyn ShutdownHooks> = self.inner.clone();
            let started = self.inner.shutdown.begin_graceful(
                self.inner.config.shutdown_timeout(),
                self.inner.config.settle_window(),
                hooks,
            )?;
            if !started {
                debug!(target: "tessera::shutdown", "Shutdown already under way");
            }
            return Ok(());
        }

        self.inner.shutdown.cancel();
        self.inner.halt();
        self.inner.shutdown.complete();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn shutdown_status(&self) -> ShutdownStatus {
        self.inner.shutdown.status()
    }

    /// Hold writers on this node, as asked by a peer that is shutting down.
    ///
    /// Observers get [`CacheEvent::BlockActivity`] so connected clients can be
    /// told to hold off too. False if activity was already held.
    pub fn notify_block_activity(&self, timeout: Duration) -> bool {
        if !self.inner.shutdown.block(timeout) {
            return false;
        }
        self.inner.publish(CacheEvent::BlockActivity { timeout });
        true
    }

    pub fn notify_unblock_activity(&self) {
        if self.inner.shutdown.unblock() {
            self.inner.publish(CacheEvent::UnblockActivity);
        }
    }

    /// Wait for a graceful stop to complete. False on timeout.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutdown.wait_for_completion(timeout)
    }

    // ========================================================================
    // Single-key operations
    // ========================================================================

    /// Store a value under a key that must not exist yet.
    pub fn add(&self, key: &str, value: impl Into<Value>, options: AddOptions) -> Result<()> {
        let value = value.into();
        self.inner
            .boundary("Add", key, || self.inner.add(key, value, options))
            .map(|_| ())
    }

    /// Store or replace a value. Returns the version now stored.
    pub fn insert(&self, key: &str, value: impl Into<Value>, options: InsertOptions) -> Result<u64> {
        let value = value.into();
        self.inner
            .boundary("Insert", key, || self.inner.insert(key, value, options))
    }

    /// Remove a key, returning the value it held.
    pub fn remove(&self, key: &str, options: RemoveOptions) -> Result<Option<Value>> {
        self.inner
            .boundary("Remove", key, || self.inner.remove(key, options))
    }

    /// Remove a key without handing its value back.
    pub fn delete(&self, key: &str, options: RemoveOptions) -> Result<()> {
        self.remove(key, options).map(|_| ())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self
            .get_entry(key, GetOptions::default())?
            .map(|view| view.value))
    }

    pub fn get_entry(&self, key: &str, options: GetOptions) -> Result<Option<EntryView>> {
        self.inner
            .boundary("Get", key, || self.inner.get_entry(key, options))
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        self.inner.boundary("Contains", key, || {
            self.inner.ensure_running()?;
            self.inner.storage.contains(key)
        })
    }

    /// Try to lock an existing key.
    ///
    /// `timeout` of `None` uses the configured default lock timeout.
    pub fn lock(&self, key: &str, timeout: Option<Duration>) -> Result<LockResult> {
        self.inner.boundary("Lock", key, || self.inner.lock(key, timeout))
    }

    /// Release a lock. A preemptive unlock ignores `lock_id`.
    pub fn unlock(&self, key: &str, lock_id: Option<&LockId>, preemptive: bool) -> Result<bool> {
        self.inner.boundary("Unlock", key, || {
            self.inner.ensure_running()?;
            let released = self.inner.storage.unlock(key, lock_id, preemptive)?;
            debug!(target: "tessera::lock", key, released, preemptive, "Unlock");
            Ok(released)
        })
    }

    /// The unexpired lock currently on the key
    pub fn is_locked(&self, key: &str) -> Result<Option<LockState>> {
        self.inner.boundary("IsLocked", key, || {
            self.inner.ensure_running()?;
            self.inner.storage.lock_info(key)
        })
    }

    // ========================================================================
    // Clients
    // ========================================================================

    pub fn client_connected(
        &self,
        client_id: &str,
        info: ClientInfo,
        node: NodeAddress,
    ) -> ConnectOutcome {
        self.inner.ledger.client_connected(client_id, info, node)
    }

    pub fn client_disconnected(
        &self,
        client_id: &str,
        node: &NodeAddress,
        disconnected_at: DateTime<Utc>,
    ) -> bool {
        self.inner
            .ledger
            .client_disconnected(client_id, node, disconnected_at)
    }

    pub fn node_left(&self, node: &NodeAddress, left_at: DateTime<Utc>) -> Vec<String> {
        self.inner.ledger.node_left(node, left_at)
    }

    pub fn connected_clients(&self) -> Vec<ClientInfo> {
        self.inner.ledger.connected_clients()
    }

    pub fn ledger(&self) -> &Arc<ConnectedClientsLedger> {
        &self.inner.ledger
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub fn events(&self) -> &Arc<EventRegistry> {
        &self.inner.events
    }

    pub fn stats(&self) -> &Arc<dyn StatsCollector> {
        &self.inner.stats
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn count(&self) -> usize {
        self.inner.storage.count()
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("name", &self.inner.config.name)
            .field("running", &self.is_running())
            .field("shutdown", &self.inner.shutdown)
            .field("entries", &self.inner.storage.count())
            .finish()
    }
}

impl StoreInner {
    /// Log unexpected failures once and turn panics into `OperationFailed`.
    fn boundary<T>(&self, op: &'static str, key: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                match &e {
                    CacheError::OperationFailed { .. } => {
                        error!(target: "tessera::store", op, key, error = %e, "Operation failed")
                    }
                    e if e.is_contention() => {
                        debug!(target: "tessera::store", op, key, error = %e, "Rejected")
                    }
                    _ => debug!(target: "tessera::store", op, key, error = %e, "Not performed"),
                }
                Err(e)
            }
            Err(payload) => {
                let cause = panic_message(payload.as_ref());
                error!(target: "tessera::store", op, key, cause = %cause, "Operation panicked");
                Err(CacheError::operation_failed(format!(
                    "{} operation failed: {}",
                    op, cause
                )))
            }
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CacheError::NotRunning)
        }
    }

    /// Resolve the backing-source mode of a write and check it can be honored.
    fn data_source_mode(&self, flags: EntryFlags, provider: Option<&str>) -> Result<DataSourceMode> {
        let mode = flags.data_source_mode();
        if mode == DataSourceMode::None {
            return Ok(mode);
        }
        if !self.features.is_enabled(Feature::BackingSource) {
            return Err(CacheError::backing_source_unavailable(
                "backing source support is not enabled",
            ));
        }
        if mode == DataSourceMode::WriteBehind && !self.features.is_enabled(Feature::WriteBehind) {
            return Err(CacheError::backing_source_unavailable(
                "write-behind is not enabled",
            ));
        }
        self.pipeline.ensure_available(mode, provider)?;
        Ok(mode)
    }

    fn admit(
        &self,
        ctx: &OperationContext,
        key: &str,
        op: OperationType,
    ) -> Result<InFlightGuard<'_>> {
        let guard = self
            .shutdown
            .admit(ctx, || self.storage.is_operation_allowed(key, op))?;
        self.ensure_running()?;
        Ok(guard)
    }

    fn with_default_lock_timeout(&self, mut timeout: Option<Duration>, access: AccessType) -> Option<Duration> {
        if access == AccessType::Acquire && timeout.is_none() {
            timeout = self.config.default_lock_timeout();
        }
        timeout
    }

    fn add(&self, key: &str, value: Value, options: AddOptions) -> Result<u64> {
        self.ensure_running()?;
        check_key(key)?;
        self.stats.record_client_request();

        let AddOptions {
            meta,
            provider,
            ctx,
        } = options;
        let mode = self.data_source_mode(meta.flags, provider.as_deref())?;
        let _admitted = self.admit(&ctx, key, OperationType::Add)?;

        let mut entry = EntryPool::acquire(value);
        meta.apply(&mut entry);
        let snapshot = (mode != DataSourceMode::None).then(|| entry.clone());

        let result = self.storage.add(key, entry, &ctx)?;
        self.commit(key, result, snapshot, WriteOperationKind::Add, mode, provider, &ctx)
    }

    fn insert(&self, key: &str, value: Value, options: InsertOptions) -> Result<u64> {
        self.ensure_running()?;
        check_key(key)?;
        self.stats.record_client_request();

        let mut request = options.lock_request();
        request.lock_timeout = self.with_default_lock_timeout(request.lock_timeout, request.access);
        let InsertOptions {
            meta,
            provider,
            ctx,
            ..
        } = options;
        let mode = self.data_source_mode(meta.flags, provider.as_deref())?;
        let _admitted = self.admit(&ctx, key, OperationType::Insert)?;

        let mut entry = EntryPool::acquire(value);
        meta.apply(&mut entry);
        let snapshot = (mode != DataSourceMode::None).then(|| entry.clone());

        let result = self.storage.insert(key, entry, &request, &ctx)?;
        self.commit(key, result, snapshot, WriteOperationKind::Insert, mode, provider, &ctx)
    }

    /// Everything after the storage write of an add or insert.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        key: &str,
        result: WriteResult,
        snapshot: Option<CacheEntry>,
        kind: WriteOperationKind,
        mode: DataSourceMode,
        provider: Option<String>,
        ctx: &OperationContext,
    ) -> Result<u64> {
        if let Some(e) = CacheError::from_outcome(key, result.outcome) {
            return Err(e);
        }
        if !result.outcome.is_success() {
            return Ok(0);
        }

        self.record_write(key, &result);
        let report = self.cascade.after_insert(key, result.previous.as_ref(), ctx);
        if let Some(previous) = result.previous {
            EntryPool::release(previous);
        }
        self.publish_cascade(report?);

        if let Some(mut snapshot) = snapshot {
            snapshot.version = result.version;
            let operation = WriteOperation::new(key, Some(snapshot), kind)
                .with_provider(provider)
                .with_client(ctx.client_id.clone());
            self.sync(key, operation, mode)?;
        }
        Ok(result.version)
    }

    fn remove(&self, key: &str, options: RemoveOptions) -> Result<Option<Value>> {
        self.ensure_running()?;
        check_key(key)?;
        self.stats.record_client_request();

        let request = options.lock_request();
        let RemoveOptions {
            flags,
            provider,
            ctx,
            ..
        } = options;
        let mode = self.data_source_mode(flags, provider.as_deref())?;
        let _admitted = self.admit(&ctx, key, OperationType::Remove)?;

        let result = self
            .storage
            .remove(key, RemoveReason::Removed, &request, &ctx)?;
        if let Some(e) = CacheError::from_outcome(key, result.outcome) {
            return Err(e);
        }
        let Some(mut removed) = result.previous else {
            debug!(target: "tessera::store", key, "Nothing to remove");
            return Ok(None);
        };

        self.stats.record_delete();
        self.publish(CacheEvent::ItemRemoved {
            key: key.to_string(),
            reason: RemoveReason::Removed,
        });
        let report = self.cascade.after_remove(key, &removed, &ctx);

        let snapshot = (mode != DataSourceMode::None).then(|| removed.clone());
        let value = std::mem::take(&mut removed.value);
        EntryPool::release(removed);
        self.publish_cascade(report?);

        if let Some(snapshot) = snapshot {
            let operation = WriteOperation::new(key, Some(snapshot), WriteOperationKind::Remove)
                .with_provider(provider)
                .with_client(ctx.client_id.clone());
            self.sync(key, operation, mode)?;
        }
        Ok(Some(value))
    }

    fn get_entry(&self, key: &str, options: GetOptions) -> Result<Option<EntryView>> {
        self.ensure_running()?;
        self.stats.record_client_request();

        let mut request = options.lock_request();
        request.lock_timeout = self.with_default_lock_timeout(request.lock_timeout, request.access);
        let read = self.storage.get(key, &request, &options.ctx)?;
        if let Some(e) = CacheError::from_outcome(key, read.outcome) {
            return Err(e);
        }

        match read.entry {
            Some(entry) => {
                self.stats.record_hit();
                Ok(Some(EntryView::from_entry(entry, read.lock)))
            }
            None => {
                self.stats.record_miss();
                if options.read_through {
                    self.read_through(key, options.provider, &options.ctx)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Load a missing key from the backing source and cache it.
    fn read_through(
        &self,
        key: &str,
        provider: Option<String>,
        ctx: &OperationContext,
    ) -> Result<Option<EntryView>> {
        if !self.features.is_enabled(Feature::BackingSource) {
            return Err(CacheError::backing_source_unavailable(
                "backing source support is not enabled",
            ));
        }
        let Some(value) = self.pipeline.manager().read_thru(key, provider.as_deref())? else {
            return Ok(None);
        };
        debug!(target: "tessera::ds", key, "Loaded through backing source");

        let _admitted = self.admit(ctx, key, OperationType::Add)?;
        let mut entry = EntryPool::acquire(value);
        entry.flags = EntryFlags::READ_THRU;
        let view = EntryView::from_entry(entry.clone(), None);

        let result = self.storage.add(key, entry, ctx)?;
        match result.outcome {
            outcome if outcome.is_success() => {
                self.record_write(key, &result);
                if let Some(previous) = result.previous {
                    EntryPool::release(previous);
                }
                Ok(Some(EntryView {
                    version: result.version,
                    ..view
                }))
            }
            // Someone wrote the key while we were loading; theirs wins.
            OperationOutcome::KeyExists => {
                let read = self.storage.get(key, &Default::default(), ctx)?;
                Ok(read.entry.map(|e| EntryView::from_entry(e, read.lock)))
            }
            outcome => match CacheError::from_outcome(key, outcome) {
                Some(e) => Err(e),
                None => Ok(Some(view)),
            },
        }
    }

    fn lock(&self, key: &str, timeout: Option<Duration>) -> Result<LockResult> {
        self.ensure_running()?;
        check_key(key)?;
        self.stats.record_client_request();
        let ctx = OperationContext::new();
        let _admitted = self.admit(&ctx, key, OperationType::Lock)?;

        let lock_id = self.lock_ids.next(key);
        let timeout = timeout.or_else(|| self.config.default_lock_timeout());
        match self.storage.lock(key, lock_id.clone(), timeout)? {
            None => Ok(LockResult::missing()),
            Some(state) => {
                let granted = state.lock_id == lock_id;
                debug!(target: "tessera::lock", key, granted, lock_id = %state.lock_id, "Lock");
                Ok(LockResult::from_state(state, granted))
            }
        }
    }

    /// Push a committed root mutation to the backing source.
    ///
    /// A permanent write-through failure is reported after the local commit.
    fn sync(&self, key: &str, operation: WriteOperation, mode: DataSourceMode) -> Result<()> {
        match self.pipeline.sync_after_write(operation, mode)? {
            Some(SyncResult::WrittenThrough(result)) => {
                self.stats.record_ds_write(result.is_success());
                if result.status == OperationStatus::FailurePermanent {
                    return Err(CacheError::operation_failed(format!(
                        "write-through failed for key {}: {}",
                        key,
                        result.error.as_deref().unwrap_or("unknown error")
                    )));
                }
                Ok(())
            }
            Some(SyncResult::Requeued { .. }) => {
                self.stats.record_ds_write(false);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn record_write(&self, key: &str, result: &WriteResult) {
        match result.outcome {
            OperationOutcome::SuccessOverwrite { .. } => {
                self.stats.record_update();
                self.publish(CacheEvent::ItemUpdated {
                    key: key.to_string(),
                });
            }
            _ => {
                self.stats.record_add();
                self.publish(CacheEvent::ItemAdded {
                    key: key.to_string(),
                });
            }
        }
    }

    fn publish_cascade(&self, report: CascadeReport) {
        if !report.is_empty() {
            debug!(target: "tessera::cascade", removed = report.len(), "Dependents removed");
        }
        for (key, entry) in report.removed {
            self.stats.record_delete();
            self.publish(CacheEvent::ItemRemoved {
                key,
                reason: RemoveReason::DependencyChanged,
            });
            EntryPool::release(entry);
        }
    }

    fn publish(&self, event: CacheEvent) {
        if !self.events.is_empty() {
            self.events.publish(&event);
        }
    }

    /// Stop serving. Idempotent.
    fn halt(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let cleaner = self.cleaner.lock().take();
        if let Some(cleaner) = cleaner {
            cleaner.shutdown();
        }
        self.ledger.cancel_all();
        let discarded = self.pipeline.manager().discard_pending();
        if discarded > 0 {
            warn!(target: "tessera::store", discarded, "Stopped with write-behind work pending");
        }
        self.publish(CacheEvent::CacheStopped);
        info!(target: "tessera::store", name = %self.config.name, "Cache stopped");
    }
}

impl ShutdownHooks for StoreInner {
    fn block_activity(&self, interval: Duration) {
        info!(target: "tessera::shutdown", clients = self.ledger.len(), ?interval, "Asking clients to hold activity");
        self.publish(CacheEvent::BlockActivity { timeout: interval });
    }

    fn drain(&self, budget: Duration) -> bool {
        let drained = self.pipeline.manager().drain(budget);
        if !drained {
            warn!(
                target: "tessera::shutdown",
                pending = self.pipeline.manager().queue_stats().queue_depth,
                "Write-behind queue not drained"
            );
        }
        drained
    }

    fn unblock_activity(&self) {
        info!(target: "tessera::shutdown", "Clients may resume activity");
        self.publish(CacheEvent::UnblockActivity);
    }

    fn finish(&self) {
        self.halt();
    }
}

impl ExpirySweep for StoreInner {
    fn sweep(&self, now: Timestamp) -> usize {
        if !self.running.load(Ordering::SeqCst) {
            return 0;
        }
        let keys = self.storage.expired_keys(now);
        if keys.is_empty() {
            return 0;
        }

        let ctx = OperationContext::internal();
        let results = match self.storage.remove_bulk(&keys, RemoveReason::Expired, &ctx) {
            Ok(results) => results,
            Err(e) => {
                warn!(target: "tessera::expiry", error = %e, "Expiration sweep failed");
                return 0;
            }
        };

        let mut removed = 0;
        for (key, result) in &results {
            if result.previous.is_some() {
                removed += 1;
                self.stats.record_delete();
                self.publish(CacheEvent::ItemRemoved {
                    key: key.clone(),
                    reason: RemoveReason::Expired,
                });
            }
        }

        match self.cascade.after_bulk(&results, &ctx) {
            Ok(report) => self.publish_cascade(report),
            Err(e) => warn!(target: "tessera::expiry", error = %e, "Cascade after expiration failed"),
        }
        for (_, result) in results {
            if let Some(entry) = result.previous {
                EntryPool::release(entry);
            }
        }
        removed
    }
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid_argument("key must not be empty"));
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
