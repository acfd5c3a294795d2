//! Data source manager
//!
//! Owns the provider registry and the write-behind queue, and performs
//! synchronous write-through and read-through calls.

use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{CacheError, Result, Value};
use tracing::{debug, info, warn};

use crate::operation::{DataSourceOperationResult, WriteOperation};
use crate::provider::{DataSourceProvider, ProviderError, ProviderRegistry};
use crate::queue::{CompletionHook, QueueStats, WriteBehindQueue, WriteBehindTicket};
use crate::retry::RetryPolicy;

/// Settings for [`DataSourceManager`]
#[derive(Debug, Clone)]
pub struct DataSourceOptions {
    /// Master switch; when off every backing-source request is refused
    pub enabled: bool,
    pub write_behind_workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
}

impl Default for DataSourceOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            write_behind_workers: 1,
            queue_capacity: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct DataSourceManager {
    options: DataSourceOptions,
    providers: Arc<ProviderRegistry>,
    queue: WriteBehindQueue,
}

impl DataSourceManager {
    pub fn new(options: DataSourceOptions) -> Result<Self> {
        Self::with_registry(options, Arc::new(ProviderRegistry::new()))
    }

    pub fn with_registry(options: DataSourceOptions, providers: Arc<ProviderRegistry>) -> Result<Self> {
        let queue = WriteBehindQueue::start(
            options.write_behind_workers,
            options.queue_capacity,
            options.retry.clone(),
            Arc::clone(&providers),
        )?;
        info!(
            target: "tessera::ds",
            enabled = options.enabled,
            workers = options.write_behind_workers,
            "Data source manager started"
        );
        Ok(Self {
            options,
            providers,
            queue,
        })
    }

    pub fn options(&self) -> &DataSourceOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    pub fn register_provider(&self, provider: Arc<dyn DataSourceProvider>) {
        debug!(target: "tessera::ds", provider = provider.name(), "Provider registered");
        self.providers.register(provider);
    }

    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    /// The provider that a write/read-through to `provider` would use.
    pub fn ensure_available(&self, provider: Option<&str>) -> Result<Arc<dyn DataSourceProvider>> {
        if !self.options.enabled {
            return Err(CacheError::backing_source_unavailable(
                "backing source is disabled",
            ));
        }
        self.providers.resolve(provider)
    }

    /// One synchronous provider call.
    pub fn write_thru(&self, mut operation: WriteOperation) -> DataSourceOperationResult {
        let provider = match self.ensure_available(operation.provider.as_deref()) {
            Ok(p) => p,
            Err(e) => return DataSourceOperationResult::permanent(operation, e.to_string()),
        };
        operation.attempts += 1;
        let outcome = provider.write(&operation);
        to_result(operation, outcome)
    }

    /// Synchronous bulk write, one provider call per distinct provider.
    ///
    /// Results come back in the order of `operations`.
    pub fn write_thru_bulk(&self, operations: Vec<WriteOperation>) -> Vec<DataSourceOperationResult> {
        let mut groups: FxHashMap<Option<String>, Vec<usize>> = FxHashMap::default();
        for (i, op) in operations.iter().enumerate() {
            groups.entry(op.provider.clone()).or_default().push(i);
        }

        let mut slots: Vec<Option<WriteOperation>> = operations.into_iter().map(Some).collect();
        let mut results: Vec<Option<DataSourceOperationResult>> = vec![None; slots.len()];

        for (name, indices) in groups {
            let batch: Vec<WriteOperation> = indices
                .iter()
                .filter_map(|&i| slots[i].take())
                .map(|mut op| {
                    op.attempts += 1;
                    op
                })
                .collect();

            let outcomes = match self.ensure_available(name.as_deref()) {
                Ok(provider) => provider.write_bulk(&batch),
                Err(e) => vec![Err(ProviderError::Permanent(e.to_string())); batch.len()],
            };

            let mut outcomes = outcomes.into_iter();
            for (&i, op) in indices.iter().zip(batch) {
                let outcome = outcomes.next().unwrap_or_else(|| {
                    Err(ProviderError::Permanent("provider returned too few results".into()))
                });
                results[i] = Some(to_result(op, outcome));
            }
        }

        results.into_iter().flatten().collect()
    }

    pub fn write_behind(&self, operation: WriteOperation) -> Result<WriteBehindTicket> {
        self.ensure_available(operation.provider.as_deref())?;
        self.queue.enqueue(operation)
    }

    /// Requeue an operation whose write-through failed transiently.
    ///
    /// The operation keeps its snapshot and attempt count.
    pub fn enqueue_ds_operation(&self, operation: WriteOperation) -> Result<WriteBehindTicket> {
        warn!(
            target: "tessera::ds",
            key = %operation.key,
            attempts = operation.attempts,
            "Write-through failed, handing to write-behind queue"
        );
        self.queue.enqueue(operation)
    }

    pub fn read_thru(&self, key: &str, provider: Option<&str>) -> Result<Option<Value>> {
        let provider = self.ensure_available(provider)?;
        provider
            .load(key)
            .map_err(|e| CacheError::wrap(format!("read-through failed for key {}", key), e))
    }

    pub fn set_completion_hook(&self, hook: CompletionHook) {
        self.queue.set_completion_hook(hook);
    }

    pub fn drain(&self, timeout: Duration) -> bool {
        self.queue.drain(timeout)
    }

    /// Drop queued write-behind work; see [`WriteBehindQueue::discard_pending`].
    pub fn discard_pending(&self) -> usize {
        self.queue.discard_pending()
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
        info!(target: "tessera::ds", "Data source manager stopped");
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }
}

impl std::fmt::Debug for DataSourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceManager")
            .field("options", &self.options)
            .field("providers", &self.providers)
            .finish()
    }
}

fn to_result(
    operation: WriteOperation,
    outcome: std::result::Result<(), ProviderError>,
) -> DataSourceOperationResult {
    match outcome {
        Ok(()) => DataSourceOperationResult::success(operation),
        Err(ProviderError::Transient(msg)) => DataSourceOperationResult::retry(operation, msg),
        Err(ProviderError::Permanent(msg)) => DataSourceOperationResult::permanent(operation, msg),
    }
}
