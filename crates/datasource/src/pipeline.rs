//! Post-commit propagation to the backing data source
//!
//! The pipeline runs after the local mutation has committed. It never touches
//! the entry itself; the facade hands it an owned snapshot of what the caller
//! wrote.

use rustc_hash::FxHashSet;
use std::sync::Arc;
use tessera_core::{CacheError, DataSourceMode, Result};
use tracing::{debug, warn};

use crate::manager::DataSourceManager;
use crate::operation::{DataSourceOperationResult, OperationStatus, WriteOperation};
use crate::queue::WriteBehindTicket;

/// Routes write-behind operations to the node that owns the queue
///
/// Clustered topologies must not run a local queue on every replica, or the
/// backing store would see one write per replica.
pub trait WriteBehindForwarder: Send + Sync {
    fn forward(&self, operation: WriteOperation) -> Result<()>;
}

/// Topology facts that decide where write-behind runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeRole {
    pub clustered: bool,
    pub bridge_target: bool,
    pub client_cache: bool,
}

impl NodeRole {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn runs_local_write_behind(&self) -> bool {
        !(self.clustered || self.bridge_target || self.client_cache)
    }
}

/// What happened to one operation after the local commit
#[derive(Debug)]
pub enum SyncResult {
    /// The provider accepted (or permanently refused) the write synchronously
    WrittenThrough(DataSourceOperationResult),
    /// Write-through failed transiently; the original snapshot is now queued
    Requeued {
        result: DataSourceOperationResult,
        ticket: WriteBehindTicket,
    },
    Queued(WriteBehindTicket),
    /// Handed to the coordinator node
    Forwarded,
}

impl SyncResult {
    /// The final result, when it is already known
    pub fn result(&self) -> Option<&DataSourceOperationResult> {
        match self {
            SyncResult::WrittenThrough(result) => Some(result),
            _ => None,
        }
    }

    pub fn ticket(&self) -> Option<&WriteBehindTicket> {
        match self {
            SyncResult::Requeued { ticket, .. } | SyncResult::Queued(ticket) => Some(ticket),
            _ => None,
        }
    }
}

pub struct DataSourceSyncPipeline {
    manager: Arc<DataSourceManager>,
    role: NodeRole,
    forwarder: Option<Arc<dyn WriteBehindForwarder>>,
}

impl DataSourceSyncPipeline {
    pub fn new(manager: Arc<DataSourceManager>, role: NodeRole) -> Self {
        Self {
            manager,
            role,
            forwarder: None,
        }
    }

    pub fn with_forwarder(mut self, forwarder: Arc<dyn WriteBehindForwarder>) -> Self {
        self.forwarder = Some(forwarder);
        self
    }

    pub fn manager(&self) -> &Arc<DataSourceManager> {
        &self.manager
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Fails fast when `mode` needs a provider that cannot be used.
    ///
    /// Called before the local mutation so a write never lands only locally
    /// when it was meant to reach the backing store too.
    pub fn ensure_available(&self, mode: DataSourceMode, provider: Option<&str>) -> Result<()> {
        match mode {
            DataSourceMode::None => Ok(()),
            DataSourceMode::WriteThrough => self.manager.ensure_available(provider).map(|_| ()),
            DataSourceMode::WriteBehind => {
                self.manager.ensure_available(provider)?;
                if !self.role.runs_local_write_behind() && self.forwarder.is_none() {
                    return Err(CacheError::backing_source_unavailable(
                        "write-behind needs a coordinator on clustered nodes",
                    ));
                }
                Ok(())
            }
        }
    }

    /// Propagate one committed mutation.
    ///
    /// `Ok(None)` for `DataSourceMode::None`.
    pub fn sync_after_write(
        &self,
        operation: WriteOperation,
        mode: DataSourceMode,
    ) -> Result<Option<SyncResult>> {
        match mode {
            DataSourceMode::None => Ok(None),
            DataSourceMode::WriteThrough => {
                let snapshot = operation.clone();
                let result = self.manager.write_thru(operation);
                self.settle_write_through(snapshot, result).map(Some)
            }
            DataSourceMode::WriteBehind => self.write_behind(operation).map(Some),
        }
    }

    /// Propagate a bulk mutation.
    ///
    /// Keys in `failed_keys` did not commit locally and are not forwarded.
    pub fn sync_after_bulk_write(
        &self,
        operations: Vec<WriteOperation>,
        failed_keys: &FxHashSet<String>,
        mode: DataSourceMode,
    ) -> Result<Vec<SyncResult>> {
        let filtered: Vec<WriteOperation> = operations
            .into_iter()
            .filter(|op| !failed_keys.contains(&op.key))
            .collect();
        if filtered.is_empty() {
            return Ok(Vec::new());
        }
        debug!(target: "tessera::ds", count = filtered.len(), ?mode, "Bulk sync");

        match mode {
            DataSourceMode::None => Ok(Vec::new()),
            DataSourceMode::WriteThrough => {
                let snapshots = filtered.clone();
                let results = self.manager.write_thru_bulk(filtered);
                snapshots
                    .into_iter()
                    .zip(results)
                    .map(|(snapshot, result)| self.settle_write_through(snapshot, result))
                    .collect()
            }
            DataSourceMode::WriteBehind => filtered
                .into_iter()
                .map(|op| self.write_behind(op))
                .collect(),
        }
    }

    fn settle_write_through(
        &self,
        snapshot: WriteOperation,
        result: DataSourceOperationResult,
    ) -> Result<SyncResult> {
        if result.status != OperationStatus::FailureRetry {
            if result.status == OperationStatus::FailurePermanent {
                warn!(
                    target: "tessera::ds",
                    key = %result.key(),
                    error = result.error.as_deref().unwrap_or(""),
                    "Write-through failed permanently"
                );
            }
            return Ok(SyncResult::WrittenThrough(result));
        }

        // The queued copy carries what the caller wrote, plus the attempt
        // already spent on the synchronous call.
        let mut retry = snapshot;
        retry.attempts = result.operation.attempts;
        let ticket = self.manager.enqueue_ds_operation(retry)?;
        Ok(SyncResult::Requeued { result, ticket })
    }

    fn write_behind(&self, operation: WriteOperation) -> Result<SyncResult> {
        if self.role.runs_local_write_behind() {
            return self.manager.write_behind(operation).map(SyncResult::Queued);
        }
        match &self.forwarder {
            Some(forwarder) => {
                forwarder.forward(operation)?;
                Ok(SyncResult::Forwarded)
            }
            None => Err(CacheError::backing_source_unavailable(
                "write-behind needs a coordinator on clustered nodes",
            )),
        }
    }
}

impl std::fmt::Debug for DataSourceSyncPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceSyncPipeline")
            .field("role", &self.role)
            .field("forwarder", &self.forwarder.is_some())
            .finish()
    }
}
