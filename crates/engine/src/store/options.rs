//! Per-call options and result views of the entry store

use std::collections::BTreeMap;
use std::time::Duration;
use tessera_core::{
    AccessType, CacheEntry, CacheError, EntryFlags, EvictionHint, ExpirationHint, GroupInfo,
    KeyDependency, LockId, LockRequest, LockState, OperationContext, QueryInfo, SyncDependency,
    Timestamp, Value,
};

/// Metadata stored alongside a value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryMeta {
    pub expiration: Option<ExpirationHint>,
    pub eviction: Option<EvictionHint>,
    pub group: Option<GroupInfo>,
    pub flags: EntryFlags,
    pub dependency: Option<KeyDependency>,
    pub sync_dependency: Option<SyncDependency>,
    pub query_info: Option<QueryInfo>,
}

impl EntryMeta {
    /// Move the metadata onto a fresh entry shell.
    pub(crate) fn apply(self, entry: &mut CacheEntry) {
        entry.expiration = self.expiration;
        entry.eviction = self.eviction;
        entry.group = self.group;
        entry.flags = self.flags;
        entry.dependency = self.dependency;
        entry.sync_dependency = self.sync_dependency;
        entry.query_info = self.query_info;
    }
}

macro_rules! meta_builders {
    ($ty:ty) => {
        impl $ty {
            pub fn with_expiration(mut self, hint: ExpirationHint) -> Self {
                self.meta.expiration = Some(hint);
                self
            }

            pub fn with_eviction(mut self, hint: EvictionHint) -> Self {
                self.meta.eviction = Some(hint);
                self
            }

            pub fn with_group(mut self, group: GroupInfo) -> Self {
                self.meta.group = Some(group);
                self
            }

            pub fn with_flags(mut self, flags: EntryFlags) -> Self {
                self.meta.flags = flags;
                self
            }

            pub fn with_dependency(mut self, dependency: KeyDependency) -> Self {
                self.meta.dependency = Some(dependency);
                self
            }

            pub fn with_sync_dependency(mut self, dependency: SyncDependency) -> Self {
                self.meta.sync_dependency = Some(dependency);
                self
            }

            pub fn with_query_info(mut self, info: QueryInfo) -> Self {
                self.meta.query_info = Some(info);
                self
            }
        }
    };
}

macro_rules! context_builders {
    ($ty:ty) => {
        impl $ty {
            /// Name of the backing-source provider; `None` uses the default one.
            pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
                self.provider = Some(provider.into());
                self
            }

            pub fn with_context(mut self, ctx: OperationContext) -> Self {
                self.ctx = ctx;
                self
            }
        }
    };
}

#[derive(Debug, Clone, Default)]
pub struct AddOptions {
    pub meta: EntryMeta,
    pub provider: Option<String>,
    pub ctx: OperationContext,
}

meta_builders!(AddOptions);
context_builders!(AddOptions);

#[derive(Debug, Clone, Default)]
pub struct InsertOptions {
    pub meta: EntryMeta,
    pub provider: Option<String>,
    pub access: AccessType,
    pub lock_id: Option<LockId>,
    /// Expected stored version under `PreserveVersion`
    pub version: Option<u64>,
    /// Version propagated from a primary replica
    pub assigned_version: Option<u64>,
    pub lock_timeout: Option<Duration>,
    /// Keep the caller's lock after the write
    pub keep_lock: bool,
    pub ctx: OperationContext,
}

meta_builders!(InsertOptions);
context_builders!(InsertOptions);

impl InsertOptions {
    /// Write as the holder of `lock_id`.
    pub fn locked_by(mut self, lock_id: LockId) -> Self {
        self.access = AccessType::DontAcquire;
        self.lock_id = Some(lock_id);
        self
    }

    /// Take the lock while writing.
    pub fn acquiring(mut self, lock_timeout: Option<Duration>) -> Self {
        self.access = AccessType::Acquire;
        self.lock_timeout = lock_timeout;
        self
    }

    /// Write only if the stored version is still `version`.
    pub fn expecting_version(mut self, version: u64) -> Self {
        self.access = AccessType::PreserveVersion;
        self.version = Some(version);
        self
    }

    pub fn with_assigned_version(mut self, version: u64) -> Self {
        self.assigned_version = Some(version);
        self
    }

    pub fn keep_lock(mut self) -> Self {
        self.keep_lock = true;
        self
    }

    pub(crate) fn lock_request(&self) -> LockRequest {
        LockRequest {
            access: self.access,
            lock_id: self.lock_id.clone(),
            expected_version: self.version,
            assigned_version: self.assigned_version,
            lock_timeout: self.lock_timeout,
            keep_lock: self.keep_lock,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RemoveOptions {
    /// Selects the backing-source mode of the removal
    pub flags: EntryFlags,
    pub provider: Option<String>,
    pub access: AccessType,
    pub lock_id: Option<LockId>,
    pub version: Option<u64>,
    pub ctx: OperationContext,
}

context_builders!(RemoveOptions);

impl RemoveOptions {
    pub fn with_flags(mut self, flags: EntryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn locked_by(mut self, lock_id: LockId) -> Self {
        self.access = AccessType::DontAcquire;
        self.lock_id = Some(lock_id);
        self
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.access = AccessType::PreserveVersion;
        self.version = Some(version);
        self
    }

    pub(crate) fn lock_request(&self) -> LockRequest {
        LockRequest {
            access: self.access,
            lock_id: self.lock_id.clone(),
            expected_version: self.version,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    pub access: AccessType,
    pub lock_id: Option<LockId>,
    pub version: Option<u64>,
    pub lock_timeout: Option<Duration>,
    /// Load a missing key from the backing source
    pub read_through: bool,
    pub provider: Option<String>,
    pub ctx: OperationContext,
}

context_builders!(GetOptions);

impl GetOptions {
    pub fn locked_by(mut self, lock_id: LockId) -> Self {
        self.access = AccessType::DontAcquire;
        self.lock_id = Some(lock_id);
        self
    }

    pub fn acquiring(mut self, lock_timeout: Option<Duration>) -> Self {
        self.access = AccessType::Acquire;
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn expecting_version(mut self, version: u64) -> Self {
        self.access = AccessType::PreserveVersion;
        self.version = Some(version);
        self
    }

    pub fn read_through(mut self) -> Self {
        self.read_through = true;
        self
    }

    pub(crate) fn lock_request(&self) -> LockRequest {
        LockRequest {
            access: self.access,
            lock_id: self.lock_id.clone(),
            expected_version: self.version,
            lock_timeout: self.lock_timeout,
            ..Default::default()
        }
    }
}

/// Read-only copy of a stored entry
#[derive(Debug, Clone, PartialEq)]
pub struct EntryView {
    pub value: Value,
    pub version: u64,
    pub lock: Option<LockState>,
    pub expiration: Option<ExpirationHint>,
    pub group: Option<GroupInfo>,
    pub flags: EntryFlags,
    pub created_at: Timestamp,
    pub last_modified: Timestamp,
}

impl EntryView {
    pub(crate) fn from_entry(entry: CacheEntry, lock: Option<LockState>) -> Self {
        Self {
            value: entry.value,
            version: entry.version,
            lock,
            expiration: entry.expiration,
            group: entry.group,
            flags: entry.flags,
            created_at: entry.created_at,
            last_modified: entry.last_modified,
        }
    }
}

/// Answer to a lock request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockResult {
    pub granted: bool,
    /// The caller's lock when granted, otherwise the current holder's
    pub lock_id: Option<LockId>,
    pub lock_date: Option<Timestamp>,
    pub expires_after: Option<Duration>,
}

impl LockResult {
    pub(crate) fn missing() -> Self {
        Self {
            granted: false,
            lock_id: None,
            lock_date: None,
            expires_after: None,
        }
    }

    pub(crate) fn from_state(state: LockState, granted: bool) -> Self {
        Self {
            granted,
            lock_id: Some(state.lock_id),
            lock_date: Some(state.acquired_at),
            expires_after: state.expires_after,
        }
    }
}

/// Per-key result of a bulk call
///
/// Keys absent from `failed` succeeded (or were a no-op, such as removing a
/// key that does not exist).
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub failed: BTreeMap<String, CacheError>,
    /// Version stored for each committed key
    pub versions: BTreeMap<String, u64>,
    /// Values handed back by `remove_bulk`
    pub removed: BTreeMap<String, Value>,
}

impl BulkOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn error_for(&self, key: &str) -> Option<&CacheError> {
        self.failed.get(key)
    }

    pub fn failed_keys(&self) -> impl Iterator<Item = &str> {
        self.failed.keys().map(String::as_str)
    }

    pub fn version_of(&self, key: &str) -> Option<u64> {
        self.versions.get(key).copied()
    }

    pub(crate) fn fail(&mut self, key: impl Into<String>, error: CacheError) {
        self.failed.insert(key.into(), error);
    }
}
