//! In-memory keyed storage engine
//!
//! `LocalStore` keeps entries in a DashMap. Every per-key mutation runs inside
//! the shard entry guard with the [`LockController`] evaluated there, so writers
//! to the same key serialize while writers to different keys only meet at shard
//! granularity.
//!
//! # Dependencies
//!
//! An entry declaring `KeyDependency { keys }` is registered in each parent's
//! `dependents`. Parent links are updated after the child's guard is released,
//! so a write never holds two shard guards at once. A write that declares
//! parents holds the dependency gate exclusively from the parent check until
//! the links are in place; every other write and remove holds it shared. A
//! parent therefore can't disappear between the check and the link. Overwriting
//! or removing a parent hands the old entry (with its `dependents`) back to the
//! caller, which owns the cascade.
//!
//! # Expiration
//!
//! Expired entries read as missing. They stay in the map until
//! [`CacheImpl::expired_keys`] reports them and the caller removes them with
//! `RemoveReason::Expired`, which only succeeds if the stored entry is still
//! expired at that point.
//!
//! # Lock order
//!
//! dependency gate → shard guard → ttl mutex. The ttl mutex is never held while
//! taking a guard.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use tessera_concurrency::{Decision, LockAttempt, LockController, ReadDecision};
use tessera_core::{
    AccessType, CacheEntry, CacheImpl, ExpirationHint, KeyDependency, LockId, LockRequest,
    LockState, OperationContext, OperationOutcome, OperationType, ReadResult, RemoveReason,
    Result, Timestamp, WriteResult,
};

use crate::ttl::TtlIndex;

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// DashMap-backed [`CacheImpl`]
pub struct LocalStore {
    entries: DashMap<String, CacheEntry, FxBuildHasher>,
    ttl: Mutex<TtlIndex>,
    controller: LockController,
    /// 0 = unbounded
    max_entries: usize,
    len: AtomicUsize,
    /// Key prefixes writable while a graceful shutdown is in progress
    shutdown_allow_list: RwLock<Vec<String>>,
    /// Exclusive for writes that declare parents, shared for everything else
    dependency_gate: RwLock<()>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::with_controller(LockController::default())
    }

    pub fn with_controller(controller: LockController) -> Self {
        LocalStore {
            entries: DashMap::with_hasher(FxBuildHasher::default()),
            ttl: Mutex::new(TtlIndex::new()),
            controller,
            max_entries: 0,
            len: AtomicUsize::new(0),
            shutdown_allow_list: RwLock::new(Vec::new()),
            dependency_gate: RwLock::new(()),
        }
    }

    /// Cap the number of entries; new keys beyond it get `NeedsEviction`.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Let writes to keys starting with `prefix` through during shutdown.
    pub fn allow_during_shutdown(&self, prefix: impl Into<String>) {
        self.shutdown_allow_list.write().push(prefix.into());
    }

    pub fn controller(&self) -> &LockController {
        &self.controller
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw stored entry, expired or not
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.entries.clear();
        *self.ttl.lock() = TtlIndex::new();
        self.len.store(0, Ordering::Release);
    }

    fn reserve_slot(&self) -> bool {
        if self.max_entries == 0 {
            self.len.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        let max = self.max_entries;
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    fn release_slot(&self) {
        let _ = self
            .len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Every declared parent must exist and be live.
    fn check_dependencies(&self, entry: &CacheEntry, now: Timestamp) -> bool {
        match &entry.dependency {
            None => true,
            Some(dep) => dep.keys.iter().all(|parent| {
                self.entries
                    .get(parent)
                    .map_or(false, |p| !p.is_expired_at(now))
            }),
        }
    }

    /// Move `key` from the parents of `old` to the parents of `new`.
    fn relink(&self, key: &str, old: Option<&KeyDependency>, new: Option<&KeyDependency>) {
        if let Some(old) = old {
            for parent in old.keys.iter() {
                if new.map_or(false, |n| n.keys.contains(parent)) {
                    continue;
                }
                if let Some(mut p) = self.entries.get_mut(parent) {
                    p.dependents.remove(key);
                }
            }
        }
        if let Some(new) = new {
            for parent in new.keys.iter() {
                if let Some(mut p) = self.entries.get_mut(parent) {
                    p.dependents.insert(key.to_string());
                }
            }
        }
    }

    fn write(
        &self,
        key: &str,
        mut entry: CacheEntry,
        request: &LockRequest,
        add_only: bool,
    ) -> Result<WriteResult> {
        let _gate = if entry.dependency.is_some() {
            GateGuard::Exclusive(self.dependency_gate.write())
        } else {
            GateGuard::Shared(self.dependency_gate.read())
        };
        let now = Timestamp::now();
        if !self.check_dependencies(&entry, now) {
            debug!(target: "tessera::store", key, "Dependency key missing");
            return Ok(WriteResult::rejected(OperationOutcome::DependencyKeyNotExist));
        }
        entry.dependents.clear();
        let new_dependency = entry.dependency.clone();

        let result = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let (live, created_at) = {
                    let current = occupied.get();
                    (!current.is_expired_at(now), current.created_at)
                };
                if add_only && live {
                    return Ok(WriteResult::rejected(OperationOutcome::KeyExists));
                }
                let existing = if live { Some(occupied.get()) } else { None };
                let decision = self.controller.evaluate_write(
                    key,
                    existing,
                    entry.group.as_ref(),
                    request,
                    now,
                );
                let (version, lock, granted) = match decision {
                    Decision::Proceed {
                        version,
                        lock,
                        granted,
                    } => (version, lock, granted),
                    Decision::Reject(outcome) => return Ok(WriteResult::rejected(outcome)),
                };

                stamp(&mut entry, version, lock, if live { created_at } else { now }, now);
                self.index_expiry(key, &entry);
                let previous = std::mem::replace(occupied.get_mut(), entry);
                let outcome = if live {
                    OperationOutcome::SuccessOverwrite {
                        previous_version: previous.version,
                    }
                } else {
                    OperationOutcome::Success
                };
                WriteResult {
                    outcome,
                    version,
                    previous: Some(previous),
                    granted_lock: granted,
                }
            }
            Entry::Vacant(vacant) => {
                let decision = self.controller.evaluate_write(
                    key,
                    None,
                    entry.group.as_ref(),
                    request,
                    now,
                );
                let (version, lock, granted) = match decision {
                    Decision::Proceed {
                        version,
                        lock,
                        granted,
                    } => (version, lock, granted),
                    Decision::Reject(outcome) => return Ok(WriteResult::rejected(outcome)),
                };
                if !self.reserve_slot() {
                    debug!(target: "tessera::store", key, max = self.max_entries, "Store full");
                    return Ok(WriteResult::rejected(OperationOutcome::NeedsEviction));
                }

                stamp(&mut entry, version, lock, now, now);
                self.index_expiry(key, &entry);
                vacant.insert(entry);
                WriteResult {
                    outcome: OperationOutcome::Success,
                    version,
                    previous: None,
                    granted_lock: granted,
                }
            }
        };

        let old_dependency = result.previous.as_ref().and_then(|p| p.dependency.as_ref());
        if old_dependency.is_some() || new_dependency.is_some() {
            self.relink(key, old_dependency, new_dependency.as_ref());
        }
        trace!(target: "tessera::store", key, version = result.version, "Write applied");
        Ok(result)
    }

    /// Called with the key's shard guard held.
    fn index_expiry(&self, key: &str, entry: &CacheEntry) {
        let mut ttl = self.ttl.lock();
        match entry.expires_at() {
            Some(at) => ttl.insert(key.to_string(), at),
            None => {
                ttl.remove(key);
            }
        }
    }
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

/// Held for the whole of a write or remove
enum GateGuard<'a> {
    Shared(RwLockReadGuard<'a, ()>),
    Exclusive(RwLockWriteGuard<'a, ()>),
}

fn stamp(
    entry: &mut CacheEntry,
    version: u64,
    lock: Option<LockState>,
    created_at: Timestamp,
    now: Timestamp,
) {
    entry.version = version;
    entry.lock = lock;
    entry.created_at = created_at;
    entry.last_modified = now;
    entry.last_accessed = now;
}

fn is_sliding(entry: &CacheEntry) -> bool {
    matches!(entry.expiration, Some(ExpirationHint::Sliding(_)))
}

fn miss() -> ReadResult {
    ReadResult {
        entry: None,
        lock: None,
        outcome: OperationOutcome::Failure,
    }
}

impl CacheImpl for LocalStore {
    fn add(&self, key: &str, entry: CacheEntry, _ctx: &OperationContext) -> Result<WriteResult> {
        self.write(key, entry, &LockRequest::default(), true)
    }

    fn insert(
        &self,
        key: &str,
        entry: CacheEntry,
        request: &LockRequest,
        _ctx: &OperationContext,
    ) -> Result<WriteResult> {
        self.write(key, entry, request, false)
    }

    fn remove(
        &self,
        key: &str,
        reason: RemoveReason,
        request: &LockRequest,
        _ctx: &OperationContext,
    ) -> Result<WriteResult> {
        let _gate = self.dependency_gate.read();
        let now = Timestamp::now();
        let (removed, version) = match self.entries.entry(key.to_string()) {
            Entry::Vacant(_) => return Ok(WriteResult::rejected(OperationOutcome::Failure)),
            Entry::Occupied(occupied) => {
                // Live entries only go through explicit removes. Expired ones
                // only go through the sweep, and only if nothing replaced them.
                let expired = occupied.get().is_expired_at(now);
                if expired != (reason == RemoveReason::Expired) {
                    trace!(target: "tessera::store", key, ?reason, expired, "Remove skipped");
                    return Ok(WriteResult::rejected(OperationOutcome::Failure));
                }
                match self
                    .controller
                    .evaluate_remove(key, occupied.get(), request, now)
                {
                    Decision::Proceed { version, .. } => {
                        self.ttl.lock().remove(key);
                        (occupied.remove(), version)
                    }
                    Decision::Reject(outcome) => return Ok(WriteResult::rejected(outcome)),
                }
            }
        };
        self.release_slot();

        if removed.dependency.is_some() {
            self.relink(key, removed.dependency.as_ref(), None);
        }
        trace!(target: "tessera::store", key, ?reason, "Entry removed");
        Ok(WriteResult {
            outcome: OperationOutcome::Success,
            version,
            previous: Some(removed),
            granted_lock: None,
        })
    }

    fn get(&self, key: &str, request: &LockRequest, _ctx: &OperationContext) -> Result<ReadResult> {
        let now = Timestamp::now();

        if request.access == AccessType::IgnoreLock {
            // Shared guard unless a sliding expiration has to be touched
            let fast = match self.entries.get(key) {
                None => return Ok(miss()),
                Some(e) if e.is_expired_at(now) => return Ok(miss()),
                Some(e) if !is_sliding(&e) => Some(ReadResult {
                    lock: e.active_lock(now).cloned(),
                    entry: Some(e.clone()),
                    outcome: OperationOutcome::Success,
                }),
                Some(_) => None,
            };
            if let Some(result) = fast {
                return Ok(result);
            }
        }

        let mut entry = match self.entries.get_mut(key) {
            Some(e) if !e.is_expired_at(now) => e,
            _ => return Ok(miss()),
        };
        match self.controller.evaluate_read(key, &entry, request, now) {
            ReadDecision::Allow { lock, granted } => {
                if granted {
                    entry.lock = lock.clone();
                }
                entry.last_accessed = now;
                if is_sliding(&entry) {
                    self.index_expiry(key, &entry);
                }
                Ok(ReadResult {
                    entry: Some(entry.clone()),
                    lock,
                    outcome: OperationOutcome::Success,
                })
            }
            ReadDecision::Deny { outcome, lock } => Ok(ReadResult {
                entry: None,
                lock,
                outcome,
            }),
        }
    }

    fn contains(&self, key: &str) -> Result<bool> {
        let now = Timestamp::now();
        Ok(self
            .entries
            .get(key)
            .map_or(false, |e| !e.is_expired_at(now)))
    }

    fn lock(
        &self,
        key: &str,
        lock_id: LockId,
        lock_timeout: Option<Duration>,
    ) -> Result<Option<LockState>> {
        let now = Timestamp::now();
        let mut entry = match self.entries.get_mut(key) {
            Some(e) if !e.is_expired_at(now) => e,
            _ => return Ok(None),
        };
        match self
            .controller
            .try_lock(key, &entry, lock_id, lock_timeout, now)
        {
            LockAttempt::Granted(state) => {
                entry.lock = Some(state.clone());
                Ok(Some(state))
            }
            LockAttempt::Held(state) => Ok(Some(state)),
        }
    }

    fn unlock(&self, key: &str, lock_id: Option<&LockId>, preemptive: bool) -> Result<bool> {
        let now = Timestamp::now();
        let mut entry = match self.entries.get_mut(key) {
            Some(e) if !e.is_expired_at(now) => e,
            _ => return Ok(false),
        };
        Ok(self
            .controller
            .release(key, &mut entry, lock_id, preemptive, now))
    }

    fn lock_info(&self, key: &str) -> Result<Option<LockState>> {
        let now = Timestamp::now();
        Ok(self.entries.get(key).and_then(|e| {
            if e.is_expired_at(now) {
                None
            } else {
                e.active_lock(now).cloned()
            }
        }))
    }

    fn add_bulk(
        &self,
        items: Vec<(String, CacheEntry)>,
        ctx: &OperationContext,
    ) -> Result<Vec<(String, WriteResult)>> {
        items
            .into_iter()
            .map(|(key, entry)| {
                let result = self.add(&key, entry, ctx)?;
                Ok((key, result))
            })
            .collect()
    }

    fn insert_bulk(
        &self,
        items: Vec<(String, CacheEntry)>,
        ctx: &OperationContext,
    ) -> Result<Vec<(String, WriteResult)>> {
        let request = LockRequest::default();
        items
            .into_iter()
            .map(|(key, entry)| {
                let result = self.insert(&key, entry, &request, ctx)?;
                Ok((key, result))
            })
            .collect()
    }

    fn remove_bulk(
        &self,
        keys: &[String],
        reason: RemoveReason,
        ctx: &OperationContext,
    ) -> Result<Vec<(String, WriteResult)>> {
        let request = LockRequest::default();
        keys.iter()
            .map(|key| {
                let result = self.remove(key, reason, &request, ctx)?;
                Ok((key.clone(), result))
            })
            .collect()
    }

    fn is_operation_allowed(&self, key: &str, op: OperationType) -> bool {
        if !op.is_write() {
            return true;
        }
        self.shutdown_allow_list
            .read()
            .iter()
            .any(|prefix| key.starts_with(prefix.as_str()))
    }

    fn expired_keys(&self, now: Timestamp) -> Vec<String> {
        let candidates = self.ttl.lock().take_expired(now);
        if candidates.is_empty() {
            return candidates;
        }

        let mut expired = Vec::with_capacity(candidates.len());
        let mut moved = Vec::new();
        for key in candidates {
            if let Some(entry) = self.entries.get(&key) {
                if entry.is_expired_at(now) {
                    expired.push(key);
                } else if let Some(at) = entry.expires_at() {
                    // Sliding window was extended after indexing
                    moved.push((key, at));
                }
            }
        }
        if !moved.is_empty() {
            let mut ttl = self.ttl.lock();
            for (key, at) in moved {
                ttl.insert(key, at);
            }
        }
        expired
    }

    fn count(&self) -> usize {
        self.len()
    }
}
