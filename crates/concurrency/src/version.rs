//! Version stamping
//!
//! Fresh entries are stamped with the milliseconds elapsed since a reference
//! epoch. Overwrites advance the stored version by one, so the version a caller
//! observes is a plain counter per key while `last_modified` keeps wall time.

use tessera_core::Timestamp;

/// 2020-01-01T00:00:00Z, the default reference epoch
pub const DEFAULT_REFERENCE_EPOCH: Timestamp = Timestamp::from_secs(1_577_836_800);

#[derive(Debug, Clone, Copy)]
pub struct VersionStamper {
    reference_epoch: Timestamp,
}

impl VersionStamper {
    pub fn new(reference_epoch: Timestamp) -> Self {
        VersionStamper { reference_epoch }
    }

    pub fn reference_epoch(&self) -> Timestamp {
        self.reference_epoch
    }

    /// Stamp for a brand-new entry. Never zero.
    pub fn stamp(&self, now: Timestamp) -> u64 {
        now.as_millis()
            .saturating_sub(self.reference_epoch.as_millis())
            .max(1)
    }

    /// Version to store for a write.
    ///
    /// An explicit version wins; otherwise an overwrite advances the previous
    /// version and a fresh key gets a time stamp.
    pub fn next(&self, previous: Option<u64>, explicit: Option<u64>, now: Timestamp) -> u64 {
        match (explicit, previous) {
            (Some(v), _) => v,
            (None, Some(prev)) => prev.saturating_add(1),
            (None, None) => self.stamp(now),
        }
    }
}

impl Default for VersionStamper {
    fn default() -> Self {
        Self::new(DEFAULT_REFERENCE_EPOCH)
    }
}
