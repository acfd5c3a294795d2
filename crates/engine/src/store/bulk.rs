//! Bulk operations
//!
//! A batch is admitted once, then written in chunks of
//! `storage.bulk_chunk_size`. The cancellation token is checked before each
//! chunk; keys of chunks that never ran are reported as `OperationCanceled`,
//! chunks that ran keep their effects.

use super::options::{AddOptions, BulkOutcome, EntryMeta, InsertOptions, RemoveOptions};
use super::{check_key, EntryStore, StoreInner};
use crate::events::CacheEvent;
use crate::pool::EntryPool;
use rustc_hash::FxHashSet;
use tessera_core::{
    AccessType, CacheEntry, CacheError, DataSourceMode, OperationContext, OperationType,
    RemoveReason, Result, Value, WriteResult,
};
use tessera_datasource::{OperationStatus, SyncResult, WriteOperation, WriteOperationKind};
use tracing::debug;

impl EntryStore {
    /// Add every item; existing keys fail individually with `KeyExists`.
    pub fn add_bulk(&self, items: Vec<(String, Value)>, options: AddOptions) -> Result<BulkOutcome> {
        let AddOptions {
            meta,
            provider,
            ctx,
        } = options;
        self.inner.boundary("AddBulk", "", || {
            self.inner
                .write_bulk(OperationType::Add, items, meta, provider, &ctx)
        })
    }

    /// Insert every item.
    ///
    /// Bulk inserts take no lock or version preconditions; `options` may only
    /// carry metadata, a provider and a context.
    pub fn insert_bulk(
        &self,
        items: Vec<(String, Value)>,
        options: InsertOptions,
    ) -> Result<BulkOutcome> {
        if options.access != AccessType::IgnoreLock || options.assigned_version.is_some() {
            return Err(CacheError::invalid_argument(
                "bulk inserts do not take lock or version preconditions",
            ));
        }
        let InsertOptions {
            meta,
            provider,
            ctx,
            ..
        } = options;
        self.inner.boundary("InsertBulk", "", || {
            self.inner
                .write_bulk(OperationType::Insert, items, meta, provider, &ctx)
        })
    }

    /// Remove every key; removed values come back in `BulkOutcome::removed`.
    pub fn remove_bulk(&self, keys: &[String], options: RemoveOptions) -> Result<BulkOutcome> {
        if options.access != AccessType::IgnoreLock {
            return Err(CacheError::invalid_argument(
                "bulk removes do not take lock or version preconditions",
            ));
        }
        self.inner
            .boundary("RemoveBulk", "", || self.inner.remove_bulk(keys, options))
    }
}

impl StoreInner {
    fn write_bulk(
        &self,
        op: OperationType,
        items: Vec<(String, Value)>,
        meta: EntryMeta,
        provider: Option<String>,
        ctx: &OperationContext,
    ) -> Result<BulkOutcome> {
        self.ensure_running()?;
        self.stats.record_client_request();
        let keys: Vec<String> = items.iter().map(|(k, _)| k.clone()).collect();
        for key in &keys {
            check_key(key)?;
        }

        let mode = self.data_source_mode(meta.flags, provider.as_deref())?;
        let _admitted = self
            .shutdown
            .admit(ctx, || self.storage.is_bulk_operation_allowed(&keys, op))?;
        self.ensure_running()?;

        let kind = match op {
            OperationType::Add => WriteOperationKind::Add,
            _ => WriteOperationKind::Insert,
        };
        let chunk_size = self.config.storage.bulk_chunk_size.max(1);
        let mut outcome = BulkOutcome::default();
        let mut items = items.into_iter();

        loop {
            let chunk: Vec<(String, Value)> = items.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            if ctx.check_cancelled().is_err() {
                let skipped = chunk.into_iter().chain(items.by_ref());
                mark_cancelled(&mut outcome, skipped.map(|(k, _)| k));
                break;
            }

            let entries: Vec<(String, CacheEntry)> = chunk
                .into_iter()
                .map(|(key, value)| {
                    let mut entry = EntryPool::acquire(value);
                    meta.clone().apply(&mut entry);
                    (key, entry)
                })
                .collect();
            let snapshots: Vec<(String, CacheEntry)> = if mode != DataSourceMode::None {
                entries.clone()
            } else {
                Vec::new()
            };

            let results = match op {
                OperationType::Add => self.storage.add_bulk(entries, ctx)?,
                _ => self.storage.insert_bulk(entries, ctx)?,
            };
            let failed = self.settle_chunk(&results, &mut outcome);
            let report = self.cascade.after_bulk(&results, ctx);
            release_previous(results);
            self.publish_cascade(report?);

            if mode != DataSourceMode::None {
                let operations = snapshots
                    .into_iter()
                    .filter(|(key, _)| !failed.contains(key))
                    .map(|(key, mut entry)| {
                        entry.version = outcome.versions.get(&key).copied().unwrap_or_default();
                        WriteOperation::new(key, Some(entry), kind)
                            .with_provider(provider.clone())
                            .with_client(ctx.client_id.clone())
                    })
                    .collect();
                self.sync_bulk(operations, &failed, mode, &mut outcome)?;
            }
        }

        debug!(
            target: "tessera::store",
            ?op,
            total = keys.len(),
            failed = outcome.failed.len(),
            "Bulk write done"
        );
        Ok(outcome)
    }

    fn remove_bulk(&self, keys: &[String], options: RemoveOptions) -> Result<BulkOutcome> {
        self.ensure_running()?;
        self.stats.record_client_request();
        for key in keys {
            check_key(key)?;
        }

        let RemoveOptions {
            flags,
            provider,
            ctx,
            ..
        } = options;
        let mode = self.data_source_mode(flags, provider.as_deref())?;
        let _admitted = self.shutdown.admit(&ctx, || {
            self.storage
                .is_bulk_operation_allowed(keys, OperationType::Remove)
        })?;
        self.ensure_running()?;

        let chunk_size = self.config.storage.bulk_chunk_size.max(1);
        let mut outcome = BulkOutcome::default();
        let mut chunks = keys.chunks(chunk_size);

        while let Some(chunk) = chunks.next() {
            if ctx.check_cancelled().is_err() {
                let skipped = chunk.iter().chain(chunks.by_ref().flatten()).cloned();
                mark_cancelled(&mut outcome, skipped);
                break;
            }

            let results = self
                .storage
                .remove_bulk(chunk, RemoveReason::Removed, &ctx)?;
            let mut failed: FxHashSet<String> = FxHashSet::default();
            let mut snapshots = Vec::new();
            for (key, result) in &results {
                if let Some(e) = CacheError::from_outcome(key, result.outcome) {
                    failed.insert(key.clone());
                    outcome.fail(key.clone(), e);
                    continue;
                }
                match &result.previous {
                    Some(entry) => {
                        self.stats.record_delete();
                        self.publish(CacheEvent::ItemRemoved {
                            key: key.clone(),
                            reason: RemoveReason::Removed,
                        });
                        if mode != DataSourceMode::None {
                            snapshots.push((key.clone(), entry.clone()));
                        }
                    }
                    None => {
                        failed.insert(key.clone());
                    }
                }
            }

            let report = self.cascade.after_bulk(&results, &ctx);
            for (key, result) in results {
                if let Some(mut entry) = result.previous {
                    outcome
                        .removed
                        .insert(key, std::mem::take(&mut entry.value));
                    EntryPool::release(entry);
                }
            }
            self.publish_cascade(report?);

            if mode != DataSourceMode::None {
                let operations = snapshots
                    .into_iter()
                    .map(|(key, entry)| {
                        WriteOperation::new(key, Some(entry), WriteOperationKind::Remove)
                            .with_provider(provider.clone())
                            .with_client(ctx.client_id.clone())
                    })
                    .collect();
                self.sync_bulk(operations, &failed, mode, &mut outcome)?;
            }
        }
        Ok(outcome)
    }

    /// Record per-key results of one chunk. Returns the keys that did not commit.
    fn settle_chunk(
        &self,
        results: &[(String, WriteResult)],
        outcome: &mut BulkOutcome,
    ) -> FxHashSet<String> {
        let mut failed = FxHashSet::default();
        for (key, result) in results {
            if let Some(e) = CacheError::from_outcome(key, result.outcome) {
                failed.insert(key.clone());
                outcome.fail(key.clone(), e);
            } else if result.outcome.is_success() {
                outcome.versions.insert(key.clone(), result.version);
                self.record_write(key, result);
            } else {
                failed.insert(key.clone());
            }
        }
        failed
    }

    fn sync_bulk(
        &self,
        operations: Vec<WriteOperation>,
        failed: &FxHashSet<String>,
        mode: DataSourceMode,
        outcome: &mut BulkOutcome,
    ) -> Result<()> {
        for synced in self.pipeline.sync_after_bulk_write(operations, failed, mode)? {
            match synced {
                SyncResult::WrittenThrough(result) => {
                    self.stats.record_ds_write(result.is_success());
                    if result.status == OperationStatus::FailurePermanent {
                        let message = format!(
                            "write-through failed for key {}: {}",
                            result.key(),
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                        outcome.fail(result.key(), CacheError::operation_failed(message));
                    }
                }
                SyncResult::Requeued { .. } => self.stats.record_ds_write(false),
                _ => {}
            }
        }
        Ok(())
    }
}

fn mark_cancelled(outcome: &mut BulkOutcome, keys: impl Iterator<Item = String>) {
    let mut skipped = 0;
    for key in keys {
        outcome.fail(key, CacheError::OperationCanceled);
        skipped += 1;
    }
    debug!(target: "tessera::store", skipped, "Bulk operation cancelled");
}

fn release_previous(results: Vec<(String, WriteResult)>) {
    for (_, result) in results {
        if let Some(entry) = result.previous {
            EntryPool::release(entry);
        }
    }
}
