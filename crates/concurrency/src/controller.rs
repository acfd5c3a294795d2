//! Lock and version evaluation for a single key
//!
//! [`LockController`] is a pure decision function over the entry currently
//! stored for a key. It never mutates storage; the storage engine calls it from
//! inside its per-key critical section and applies the [`Decision`].
//!
//! ## Access types
//!
//! | Access | Proceeds when |
//! |---|---|
//! | `IgnoreLock` | always |
//! | `Acquire` | key unlocked, lock expired, or caller already holds it |
//! | `DontAcquire` | key unlocked, or caller presents the current lock id |
//! | `PreserveVersion` | stored version equals the caller's expected version |
//!
//! An expired lock is treated exactly like no lock.

use crate::lock_id::LockIdGenerator;
use crate::version::VersionStamper;
use std::time::Duration;
use tessera_core::{
    AccessType, CacheEntry, GroupInfo, LockId, LockRequest, LockState, OperationOutcome, Timestamp,
};
use tracing::debug;

/// Outcome of evaluating a write or remove
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Apply the operation
    Proceed {
        /// Version to store (for removes, the version being removed)
        version: u64,
        /// Lock the entry carries after the write
        lock: Option<LockState>,
        /// Lock granted to the caller by `Acquire`
        granted: Option<LockState>,
    },
    /// Leave the entry untouched and report this outcome
    Reject(OperationOutcome),
}

impl Decision {
    pub fn is_proceed(&self) -> bool {
        matches!(self, Decision::Proceed { .. })
    }
}

/// Outcome of evaluating a read
#[derive(Debug, Clone, PartialEq)]
pub enum ReadDecision {
    /// Return the entry; `lock` is the lock it carries afterwards
    Allow {
        lock: Option<LockState>,
        granted: bool,
    },
    /// Withhold the entry, reporting the current lock if any
    Deny {
        outcome: OperationOutcome,
        lock: Option<LockState>,
    },
}

/// Result of a direct lock attempt
#[derive(Debug, Clone, PartialEq)]
pub enum LockAttempt {
    Granted(LockState),
    /// Someone else holds a valid lock
    Held(LockState),
}

impl LockAttempt {
    /// Lock on the key after the attempt
    pub fn state(&self) -> &LockState {
        match self {
            LockAttempt::Granted(s) | LockAttempt::Held(s) => s,
        }
    }
}

/// Evaluates access, assigns versions and grants locks
#[derive(Debug, Default)]
pub struct LockController {
    ids: LockIdGenerator,
    stamper: VersionStamper,
}

struct AccessGrant {
    granted: Option<LockState>,
    /// Caller presented the id of the lock currently held
    holder: bool,
}

impl LockController {
    pub fn new(ids: LockIdGenerator, stamper: VersionStamper) -> Self {
        LockController { ids, stamper }
    }

    pub fn lock_ids(&self) -> &LockIdGenerator {
        &self.ids
    }

    pub fn stamper(&self) -> &VersionStamper {
        &self.stamper
    }

    /// Evaluate an add/insert of `incoming_group` over `existing`.
    pub fn evaluate_write(
        &self,
        key: &str,
        existing: Option<&CacheEntry>,
        incoming_group: Option<&GroupInfo>,
        request: &LockRequest,
        now: Timestamp,
    ) -> Decision {
        let grant = match self.check_access(key, existing, request, now) {
            Ok(grant) => grant,
            Err(outcome) => return Decision::Reject(outcome),
        };

        let previous = existing.map(|e| e.version);
        if let (Some(assigned), Some(prev)) = (request.assigned_version, previous) {
            if assigned <= prev {
                debug!(target: "tessera::lock", key, assigned, stored = prev, "Stale assigned version");
                return Decision::Reject(OperationOutcome::VersionMismatch);
            }
        }

        if let Some(existing) = existing {
            if !GroupInfo::is_compatible(existing.group.as_ref(), incoming_group) {
                debug!(target: "tessera::lock", key, "Incompatible data group");
                return Decision::Reject(OperationOutcome::IncompatibleGroup);
            }
        }

        let lock = match (&grant.granted, existing) {
            (Some(granted), _) => Some(granted.clone()),
            (None, Some(_)) if grant.holder && !request.keep_lock => None,
            (None, Some(existing)) => existing.active_lock(now).cloned(),
            (None, None) => None,
        };

        Decision::Proceed {
            version: self.stamper.next(previous, request.assigned_version, now),
            lock,
            granted: grant.granted,
        }
    }

    /// Evaluate a remove of `existing`.
    pub fn evaluate_remove(
        &self,
        key: &str,
        existing: &CacheEntry,
        request: &LockRequest,
        now: Timestamp,
    ) -> Decision {
        match self.check_access(key, Some(existing), request, now) {
            Ok(grant) => Decision::Proceed {
                version: existing.version,
                lock: None,
                granted: grant.granted,
            },
            Err(outcome) => Decision::Reject(outcome),
        }
    }

    /// Evaluate a read, granting the lock on `Acquire`.
    pub fn evaluate_read(
        &self,
        key: &str,
        existing: &CacheEntry,
        request: &LockRequest,
        now: Timestamp,
    ) -> ReadDecision {
        match self.check_access(key, Some(existing), request, now) {
            Ok(AccessGrant {
                granted: Some(granted),
                ..
            }) => ReadDecision::Allow {
                lock: Some(granted),
                granted: true,
            },
            Ok(_) => ReadDecision::Allow {
                lock: existing.active_lock(now).cloned(),
                granted: false,
            },
            Err(outcome) => ReadDecision::Deny {
                outcome,
                lock: existing.active_lock(now).cloned(),
            },
        }
    }

    /// Lock `existing` for `lock_id`, unless a different valid lock is held.
    ///
    /// Re-locking with the id already held refreshes the lock.
    pub fn try_lock(
        &self,
        key: &str,
        existing: &CacheEntry,
        lock_id: LockId,
        lock_timeout: Option<Duration>,
        now: Timestamp,
    ) -> LockAttempt {
        match existing.active_lock(now) {
            Some(held) if held.lock_id != lock_id => {
                debug!(target: "tessera::lock", key, holder = %held.lock_id, "Lock held by another caller");
                LockAttempt::Held(held.clone())
            }
            _ => LockAttempt::Granted(LockState::new(lock_id, now, lock_timeout)),
        }
    }

    /// Release the lock on `entry`.
    ///
    /// Returns `false` only when a non-preemptive caller presents an id that does
    /// not match a still-valid lock.
    pub fn release(
        &self,
        key: &str,
        entry: &mut CacheEntry,
        lock_id: Option<&LockId>,
        preemptive: bool,
        now: Timestamp,
    ) -> bool {
        let matches = match entry.active_lock(now) {
            None => true,
            Some(_) if preemptive => true,
            Some(held) => lock_id == Some(&held.lock_id),
        };
        if matches {
            entry.lock = None;
        } else {
            debug!(target: "tessera::lock", key, "Unlock with non-matching lock id");
        }
        matches
    }

    fn check_access(
        &self,
        key: &str,
        existing: Option<&CacheEntry>,
        request: &LockRequest,
        now: Timestamp,
    ) -> Result<AccessGrant, OperationOutcome> {
        let held = existing.and_then(|e| e.active_lock(now));
        let presented = request.lock_id.as_ref();
        let holder = matches!((held, presented), (Some(h), Some(p)) if h.lock_id == *p);

        match request.access {
            AccessType::IgnoreLock => Ok(AccessGrant {
                granted: None,
                holder: false,
            }),
            AccessType::Acquire => {
                if held.is_some() && !holder {
                    debug!(target: "tessera::lock", key, "Acquire refused, item locked");
                    return Err(OperationOutcome::ItemLocked);
                }
                let lock_id = presented.cloned().unwrap_or_else(|| self.ids.next(key));
                Ok(AccessGrant {
                    granted: Some(LockState::new(lock_id, now, request.lock_timeout)),
                    holder,
                })
            }
            AccessType::DontAcquire => {
                if held.is_some() && !holder {
                    debug!(target: "tessera::lock", key, "Write refused, item locked");
                    return Err(OperationOutcome::ItemLocked);
                }
                Ok(AccessGrant {
                    granted: None,
                    holder,
                })
            }
            AccessType::PreserveVersion => {
                let stored = existing.map(|e| e.version);
                if stored.is_none() || stored != request.expected_version {
                    debug!(
                        target: "tessera::lock",
                        key,
                        expected = ?request.expected_version,
                        stored = ?stored,
                        "Version precondition failed"
                    );
                    return Err(OperationOutcome::VersionMismatch);
                }
                Ok(AccessGrant {
                    granted: None,
                    holder,
                })
            }
        }
    }
}
