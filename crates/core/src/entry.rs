//! Entry model
//!
//! `CacheEntry` is the value object the storage engine owns once an operation
//! commits. It carries no behavior beyond small predicates; all decisions about
//! whether a mutation may proceed live in the concurrency layer.
//!
//! # Invariants
//!
//! - `version` strictly increases on every successful overwrite of the same key.
//! - At most one active lock per key. A lock whose duration elapsed is treated as
//!   absent by every reader.
//! - `dependents` lists keys whose entries declared a `KeyDependency` on this key
//!   and must be removed when this entry is removed or replaced.

use crate::timestamp::Timestamp;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

// ============================================================================
// Locks
// ============================================================================

/// Opaque lock handle handed to the caller that acquired a lock
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockId(String);

impl LockId {
    pub fn new(id: impl Into<String>) -> Self {
        LockId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LockId {
    fn from(s: &str) -> Self {
        LockId(s.to_string())
    }
}

impl From<String> for LockId {
    fn from(s: String) -> Self {
        LockId(s)
    }
}

/// Pessimistic lock held on a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockState {
    pub lock_id: LockId,
    pub acquired_at: Timestamp,
    /// `None` means the lock is held until explicitly released.
    pub expires_after: Option<Duration>,
}

impl LockState {
    pub fn new(lock_id: LockId, acquired_at: Timestamp, expires_after: Option<Duration>) -> Self {
        Self {
            lock_id,
            acquired_at,
            expires_after,
        }
    }

    /// When the lock stops being valid, if it ever does
    pub fn expires_at(&self) -> Option<Timestamp> {
        self.expires_after
            .map(|d| self.acquired_at.saturating_add(d))
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        match self.expires_at() {
            Some(deadline) => !now.is_before(deadline),
            None => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Timestamp::now())
    }
}

// ============================================================================
// Group / flags / hints
// ============================================================================

/// Data group an entry belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group: String,
    pub subgroup: Option<String>,
}

impl GroupInfo {
    pub fn new(group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            subgroup: None,
        }
    }

    pub fn with_subgroup(mut self, subgroup: impl Into<String>) -> Self {
        self.subgroup = Some(subgroup.into());
        self
    }

    /// Whether an incoming write with group `incoming` may replace an entry
    /// carrying group `existing`.
    ///
    /// Both ungrouped, or both grouped under the same group name. Subgroups may differ.
    pub fn is_compatible(existing: Option<&GroupInfo>, incoming: Option<&GroupInfo>) -> bool {
        match (existing, incoming) {
            (None, None) => true,
            (Some(a), Some(b)) => a.group == b.group,
            _ => false,
        }
    }
}

/// Bit set of per-entry markers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryFlags(u32);

impl EntryFlags {
    pub const NONE: EntryFlags = EntryFlags(0);
    pub const WRITE_THRU: EntryFlags = EntryFlags(1 << 0);
    pub const WRITE_BEHIND: EntryFlags = EntryFlags(1 << 1);
    pub const COMPRESSED: EntryFlags = EntryFlags(1 << 2);
    pub const READ_THRU: EntryFlags = EntryFlags(1 << 3);
    pub const BINARY: EntryFlags = EntryFlags(1 << 4);

    pub const fn from_bits(bits: u32) -> Self {
        EntryFlags(bits)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: EntryFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn union(self, other: EntryFlags) -> Self {
        EntryFlags(self.0 | other.0)
    }

    pub fn insert(&mut self, other: EntryFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: EntryFlags) {
        self.0 &= !other.0;
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Backing-store propagation requested by these flags.
    ///
    /// Write-through wins when both markers are set.
    pub fn data_source_mode(&self) -> DataSourceMode {
        if self.contains(EntryFlags::WRITE_THRU) {
            DataSourceMode::WriteThrough
        } else if self.contains(EntryFlags::WRITE_BEHIND) {
            DataSourceMode::WriteBehind
        } else {
            DataSourceMode::None
        }
    }
}

impl std::ops::BitOr for EntryFlags {
    type Output = EntryFlags;

    fn bitor(self, rhs: EntryFlags) -> EntryFlags {
        self.union(rhs)
    }
}

/// How a committed mutation is propagated to the external data source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSourceMode {
    /// Local only
    None,
    /// Synchronously, before the caller sees completion
    WriteThrough,
    /// Queued, asynchronously
    WriteBehind,
}

/// When an entry expires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationHint {
    /// Expires at a fixed point in time
    Absolute(Timestamp),
    /// Expires after a period without access
    Sliding(Duration),
}

impl ExpirationHint {
    /// Expiry instant given the last time the entry was touched
    pub fn expires_at(&self, last_touched: Timestamp) -> Timestamp {
        match self {
            ExpirationHint::Absolute(at) => *at,
            ExpirationHint::Sliding(idle) => last_touched.saturating_add(*idle),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EvictionPriority {
    Low,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    NotRemovable,
}

/// Hint consumed by the storage engine's eviction policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionHint {
    pub priority: EvictionPriority,
}

impl EvictionHint {
    pub fn new(priority: EvictionPriority) -> Self {
        Self { priority }
    }
}

// ============================================================================
// Dependencies and query metadata
// ============================================================================

/// Keys this entry depends on; removing or replacing any of them removes this entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDependency {
    pub keys: SmallVec<[String; 2]>,
}

impl KeyDependency {
    pub fn on<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

/// Synchronization with an item in another cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDependency {
    pub cache_id: String,
    pub key: String,
}

/// Index metadata maintained by the (external) query layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub type_name: String,
    pub attributes: BTreeMap<String, serde_json::Value>,
}

// ============================================================================
// CacheEntry
// ============================================================================

/// A stored item and its metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    /// Assigned by the lock/version controller at commit; zero before that.
    pub version: u64,
    pub created_at: Timestamp,
    /// Wall-clock stamp of the last successful write (audit trail and tie-break).
    pub last_modified: Timestamp,
    pub last_accessed: Timestamp,
    pub expiration: Option<ExpirationHint>,
    pub eviction: Option<EvictionHint>,
    pub group: Option<GroupInfo>,
    pub flags: EntryFlags,
    pub lock: Option<LockState>,
    pub dependency: Option<KeyDependency>,
    pub dependents: BTreeSet<String>,
    pub sync_dependency: Option<SyncDependency>,
    pub query_info: Option<QueryInfo>,
}

impl CacheEntry {
    pub fn new(value: impl Into<Value>) -> Self {
        let now = Timestamp::now();
        CacheEntry {
            value: value.into(),
            created_at: now,
            last_modified: now,
            last_accessed: now,
            ..Default::default()
        }
    }

    pub fn with_expiration(mut self, hint: ExpirationHint) -> Self {
        self.expiration = Some(hint);
        self
    }

    pub fn with_eviction(mut self, hint: EvictionHint) -> Self {
        self.eviction = Some(hint);
        self
    }

    pub fn with_group(mut self, group: GroupInfo) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_dependency(mut self, dependency: KeyDependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    /// The lock, if one is held and has not expired at `now`
    pub fn active_lock(&self, now: Timestamp) -> Option<&LockState> {
        self.lock.as_ref().filter(|l| !l.is_expired_at(now))
    }

    pub fn is_locked_at(&self, now: Timestamp) -> bool {
        self.active_lock(now).is_some()
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.expiration.map(|h| h.expires_at(self.last_accessed))
    }

    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.expires_at().map_or(false, |at| !now.is_before(at))
    }

    /// Clear every field so the allocation can be reused.
    ///
    /// Collections keep their capacity.
    pub fn reset(&mut self) {
        self.value = Value::default();
        self.version = 0;
        self.created_at = Timestamp::EPOCH;
        self.last_modified = Timestamp::EPOCH;
        self.last_accessed = Timestamp::EPOCH;
        self.expiration = None;
        self.eviction = None;
        self.group = None;
        self.flags = EntryFlags::NONE;
        self.lock = None;
        self.dependency = None;
        self.dependents.clear();
        self.sync_dependency = None;
        self.query_info = None;
    }
}
