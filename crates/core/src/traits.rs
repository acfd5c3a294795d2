//! Collaborator contracts consumed by the coordination core
//!
//! - [`CacheImpl`]: the keyed storage engine. It owns fine-grained locking and
//!   must run lock/version evaluation and the entry swap for a key as one
//!   critical section.
//! - [`StatsCollector`]: fire-and-forget counters, never on a correctness path.

use crate::context::OperationContext;
use crate::entry::{CacheEntry, LockId, LockState};
use crate::error::Result;
use crate::outcome::{AccessType, OperationOutcome, OperationType, RemoveReason};
use crate::timestamp::Timestamp;
use std::time::Duration;

/// Lock and version preconditions attached to a write or a locking read
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LockRequest {
    pub access: AccessType,
    /// Lock handle presented by the caller (or to be granted on `Acquire`)
    pub lock_id: Option<LockId>,
    /// Version the caller expects to find under `PreserveVersion`
    pub expected_version: Option<u64>,
    /// Version propagated from a primary replica; stamped verbatim when present
    pub assigned_version: Option<u64>,
    /// Lock duration when acquiring; `None` holds until released
    pub lock_timeout: Option<Duration>,
    /// Keep the caller's lock after a successful write by the lock holder
    pub keep_lock: bool,
}

impl LockRequest {
    pub fn ignore_lock() -> Self {
        Self::default()
    }

    pub fn acquire(lock_timeout: Option<Duration>) -> Self {
        Self {
            access: AccessType::Acquire,
            lock_timeout,
            ..Default::default()
        }
    }

    pub fn with_lock(lock_id: LockId) -> Self {
        Self {
            access: AccessType::DontAcquire,
            lock_id: Some(lock_id),
            ..Default::default()
        }
    }

    pub fn preserve_version(expected: u64) -> Self {
        Self {
            access: AccessType::PreserveVersion,
            expected_version: Some(expected),
            ..Default::default()
        }
    }

    pub fn with_assigned_version(mut self, version: u64) -> Self {
        self.assigned_version = Some(version);
        self
    }
}

/// What a storage write produced
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub outcome: OperationOutcome,
    /// Version stored by this write (zero when it did not commit)
    pub version: u64,
    /// The replaced or removed entry, handed back to the caller
    pub previous: Option<CacheEntry>,
    /// Lock granted by an `Acquire` write
    pub granted_lock: Option<LockState>,
}

impl WriteResult {
    pub fn rejected(outcome: OperationOutcome) -> Self {
        Self {
            outcome,
            version: 0,
            previous: None,
            granted_lock: None,
        }
    }
}

/// What a storage read produced
#[derive(Debug, Clone, PartialEq)]
pub struct ReadResult {
    /// Snapshot of the entry, `None` on miss or when the lock prevented the read
    pub entry: Option<CacheEntry>,
    /// Lock currently on the key (granted to this caller on `Acquire`)
    pub lock: Option<LockState>,
    /// `ItemLocked` / `VersionMismatch` when the preconditions rejected the read
    pub outcome: OperationOutcome,
}

/// The keyed storage engine
///
/// Implementations own per-key synchronization: concurrent writers to the same
/// key must observe a consistent version/lock sequence, writers to different keys
/// must not serialize against each other.
pub trait CacheImpl: Send + Sync {
    /// Store `entry` under a key that must not exist yet.
    fn add(&self, key: &str, entry: CacheEntry, ctx: &OperationContext) -> Result<WriteResult>;

    /// Store or replace `entry` subject to `request`.
    fn insert(
        &self,
        key: &str,
        entry: CacheEntry,
        request: &LockRequest,
        ctx: &OperationContext,
    ) -> Result<WriteResult>;

    /// Remove the key subject to `request`, returning the removed entry.
    fn remove(
        &self,
        key: &str,
        reason: RemoveReason,
        request: &LockRequest,
        ctx: &OperationContext,
    ) -> Result<WriteResult>;

    /// Read the key, optionally acquiring its lock.
    fn get(&self, key: &str, request: &LockRequest, ctx: &OperationContext) -> Result<ReadResult>;

    fn contains(&self, key: &str) -> Result<bool>;

    /// Try to lock an existing key with `lock_id`.
    ///
    /// Returns the lock now on the key (which is the caller's only if its id
    /// equals `lock_id`), or `None` if the key does not exist.
    fn lock(
        &self,
        key: &str,
        lock_id: LockId,
        lock_timeout: Option<Duration>,
    ) -> Result<Option<LockState>>;

    /// Release the lock. Non-preemptive unlock requires the matching id.
    fn unlock(&self, key: &str, lock_id: Option<&LockId>, preemptive: bool) -> Result<bool>;

    /// Current unexpired lock on the key
    fn lock_info(&self, key: &str) -> Result<Option<LockState>>;

    fn add_bulk(
        &self,
        items: Vec<(String, CacheEntry)>,
        ctx: &OperationContext,
    ) -> Result<Vec<(String, WriteResult)>>;

    fn insert_bulk(
        &self,
        items: Vec<(String, CacheEntry)>,
        ctx: &OperationContext,
    ) -> Result<Vec<(String, WriteResult)>>;

    fn remove_bulk(
        &self,
        keys: &[String],
        reason: RemoveReason,
        ctx: &OperationContext,
    ) -> Result<Vec<(String, WriteResult)>>;

    /// Remove dependents in one batch, returning the entries actually removed.
    fn remove_cascading_dependencies(
        &self,
        keys: &[String],
        ctx: &OperationContext,
    ) -> Result<Vec<(String, CacheEntry)>> {
        let results = self.remove_bulk(keys, RemoveReason::DependencyChanged, ctx)?;
        Ok(results
            .into_iter()
            .filter_map(|(key, result)| result.previous.map(|entry| (key, entry)))
            .collect())
    }

    /// Whether `op` on `key` may run while a graceful shutdown is in progress.
    fn is_operation_allowed(&self, key: &str, op: OperationType) -> bool;

    fn is_bulk_operation_allowed(&self, keys: &[String], op: OperationType) -> bool {
        keys.iter().all(|k| self.is_operation_allowed(k, op))
    }

    /// Keys whose expiration elapsed at `now`.
    fn expired_keys(&self, now: Timestamp) -> Vec<String>;

    fn count(&self) -> usize;
}

/// Fire-and-forget statistics sink
pub trait StatsCollector: Send + Sync {
    fn record_add(&self);
    fn record_update(&self);
    fn record_delete(&self);
    fn record_hit(&self);
    fn record_miss(&self);
    fn record_ds_write(&self, success: bool);
    fn record_client_request(&self);
}

/// Collector that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStats;

impl StatsCollector for NoopStats {
    fn record_add(&self) {}
    fn record_update(&self) {}
    fn record_delete(&self) {}
    fn record_hit(&self) {}
    fn record_miss(&self) {}
    fn record_ds_write(&self, _success: bool) {}
    fn record_client_request(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_request_constructors() {
        assert_eq!(LockRequest::ignore_lock().access, AccessType::IgnoreLock);

        let acquire = LockRequest::acquire(Some(Duration::from_secs(1)));
        assert_eq!(acquire.access, AccessType::Acquire);
        assert_eq!(acquire.lock_timeout, Some(Duration::from_secs(1)));

        let held = LockRequest::with_lock(LockId::from("l1"));
        assert_eq!(held.access, AccessType::DontAcquire);
        assert_eq!(held.lock_id, Some(LockId::from("l1")));

        let preserve = LockRequest::preserve_version(5).with_assigned_version(9);
        assert_eq!(preserve.access, AccessType::PreserveVersion);
        assert_eq!(preserve.expected_version, Some(5));
        assert_eq!(preserve.assigned_version, Some(9));
    }

    #[test]
    fn test_rejected_result_carries_no_entry() {
        let result = WriteResult::rejected(OperationOutcome::ItemLocked);
        assert_eq!(result.version, 0);
        assert!(result.previous.is_none());
        assert!(result.granted_lock.is_none());
    }
}
