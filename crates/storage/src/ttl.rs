//! Expiration index for efficient cleanup
//!
//! Maps expiry timestamp → keys (sorted) plus key → expiry, so the cleaner can
//! ask for everything due at `now` without scanning the store:
//! - `take_expired()` is O(expired count) via `BTreeMap::split_off`
//! - re-indexing a key replaces its previous expiry
//!
//! Entries are candidates only. Sliding expirations move after the index was
//! written, so callers re-check the stored entry before acting on a key.

use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use tessera_core::Timestamp;

#[derive(Debug, Default)]
pub struct TtlIndex {
    by_time: BTreeMap<Timestamp, FxHashSet<String>>,
    by_key: FxHashMap<String, Timestamp>,
}

impl TtlIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `key` to expire at `at`, replacing any earlier expiry.
    pub fn insert(&mut self, key: String, at: Timestamp) {
        if let Some(previous) = self.by_key.insert(key.clone(), at) {
            if previous == at {
                return;
            }
            self.unlink(previous, &key);
        }
        self.by_time.entry(at).or_default().insert(key);
    }

    /// Drop `key` from the index, returning the expiry it had.
    pub fn remove(&mut self, key: &str) -> Option<Timestamp> {
        let at = self.by_key.remove(key)?;
        self.unlink(at, key);
        Some(at)
    }

    pub fn expiry_of(&self, key: &str) -> Option<Timestamp> {
        self.by_key.get(key).copied()
    }

    /// Keys due at or before `now`, leaving the index untouched
    pub fn find_expired(&self, now: Timestamp) -> Vec<String> {
        self.by_time
            .range(..=now)
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect()
    }

    /// Remove and return every key due at or before `now`
    pub fn take_expired(&mut self, now: Timestamp) -> Vec<String> {
        let later = self
            .by_time
            .split_off(&now.saturating_add(std::time::Duration::from_micros(1)));
        let due = std::mem::replace(&mut self.by_time, later);

        let mut keys = Vec::new();
        for (_, bucket) in due {
            for key in bucket {
                self.by_key.remove(&key);
                keys.push(key);
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Number of distinct expiry timestamps
    pub fn timestamp_count(&self) -> usize {
        self.by_time.len()
    }

    fn unlink(&mut self, at: Timestamp, key: &str) {
        if let Some(keys) = self.by_time.get_mut(&at) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_time.remove(&at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(micros: u64) -> Timestamp {
        Timestamp::from_micros(micros)
    }

    #[test]
    fn test_insert_and_find_expired() {
        let mut index = TtlIndex::new();
        index.insert("a".into(), ts(500));
        index.insert("b".into(), ts(800));
        index.insert("c".into(), ts(1200));
        index.insert("d".into(), ts(500));

        let mut expired = index.find_expired(ts(1000));
        expired.sort();
        assert_eq!(expired, vec!["a", "b", "d"]);
        assert_eq!(index.len(), 4);
    }

    #[test]
    fn test_reinsert_replaces_expiry() {
        let mut index = TtlIndex::new();
        index.insert("a".into(), ts(500));
        index.insert("a".into(), ts(900));

        assert_eq!(index.len(), 1);
        assert_eq!(index.timestamp_count(), 1);
        assert_eq!(index.expiry_of("a"), Some(ts(900)));
        assert!(index.find_expired(ts(600)).is_empty());
    }

    #[test]
    fn test_remove() {
        let mut index = TtlIndex::new();
        index.insert("a".into(), ts(500));
        index.insert("b".into(), ts(500));

        assert_eq!(index.remove("a"), Some(ts(500)));
        assert_eq!(index.remove("a"), None);
        assert_eq!(index.find_expired(ts(600)), vec!["b"]);

        index.remove("b");
        assert!(index.is_empty());
        assert_eq!(index.timestamp_count(), 0);
    }

    #[test]
    fn test_take_expired_is_inclusive() {
        let mut index = TtlIndex::new();
        index.insert("a".into(), ts(500));
        index.insert("b".into(), ts(1000));
        index.insert("c".into(), ts(1001));

        let mut taken = index.take_expired(ts(1000));
        taken.sort();
        assert_eq!(taken, vec!["a", "b"]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.expiry_of("c"), Some(ts(1001)));
    }

    #[test]
    fn test_take_expired_nothing_due() {
        let mut index = TtlIndex::new();
        index.insert("future".into(), ts(5000));
        assert!(index.take_expired(ts(1000)).is_empty());
        assert_eq!(index.len(), 1);
    }
}
