//! Integration tests for the storage layer
//!
//! These tests drive `LocalStore` through the `CacheImpl` contract:
//! - Per-key consistency under concurrent writers
//! - Lock semantics across threads
//! - Dependency registration and cleanup
//! - Expiration index behaviour
//! - Bulk operations

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use rand::Rng;
use tessera_core::{
    CacheEntry, CacheImpl, ExpirationHint, KeyDependency, LockId, LockRequest, OperationContext,
    OperationOutcome, RemoveReason, Timestamp, Value,
};
use tessera_storage::LocalStore;

// ============================================================================
// Helper Functions
// ============================================================================

fn ctx() -> OperationContext {
    OperationContext::new()
}

fn put(store: &LocalStore, key: &str, value: &str) -> u64 {
    store
        .insert(key, CacheEntry::new(value), &LockRequest::default(), &ctx())
        .unwrap()
        .version
}

fn value_of(store: &LocalStore, key: &str) -> Option<Value> {
    store
        .get(key, &LockRequest::default(), &ctx())
        .unwrap()
        .entry
        .map(|e| e.value)
}

// ============================================================================
// Concurrency
// ============================================================================

mod concurrency {
    use super::*;

    #[test]
    fn test_same_key_writers_no_lost_updates() {
        const THREADS: usize = 8;
        const WRITES: usize = 250;

        let store = Arc::new(LocalStore::new());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    (0..WRITES)
                        .map(|i| put(&store, "hot", &format!("{}:{}", t, i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(all.insert(v), "version {} handed out twice", v);
            }
        }

        let stored = store.peek("hot").unwrap().version;
        assert_eq!(Some(&stored), all.iter().max());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_different_keys_in_parallel() {
        const THREADS: usize = 8;
        const KEYS: usize = 200;

        let store = Arc::new(LocalStore::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..KEYS {
                        store
                            .add(&format!("t{}-k{}", t, i), CacheEntry::new(i as i64), &ctx())
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.count(), THREADS * KEYS);
        assert_eq!(store.keys().len(), THREADS * KEYS);
    }

    #[test]
    fn test_concurrent_add_single_winner() {
        const THREADS: usize = 12;

        let store = Arc::new(LocalStore::new());
        let barrier = Arc::new(Barrier::new(THREADS));
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                thread::spawn(move || {
                    barrier.wait();
                    let r = store.add("once", CacheEntry::new(t as i64), &ctx()).unwrap();
                    match r.outcome {
                        OperationOutcome::Success => {
                            wins.fetch_add(1, Ordering::SeqCst);
                        }
                        OperationOutcome::KeyExists => {}
                        other => panic!("unexpected {:?}", other),
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_locked_key_rejects_foreign_writers() {
        let store = Arc::new(LocalStore::new());
        put(&store, "k", "original");
        let granted = store.lock("k", LockId::from("owner"), None).unwrap().unwrap();
        assert_eq!(granted.lock_id, LockId::from("owner"));

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let request = LockRequest::with_lock(LockId::from(format!("intruder-{}", i)));
                    store
                        .insert("k", CacheEntry::new("hijack"), &request, &ctx())
                        .unwrap()
                        .outcome
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), OperationOutcome::ItemLocked);
        }
        assert_eq!(value_of(&store, "k"), Some(Value::from("original")));

        let owner = LockRequest::with_lock(LockId::from("owner"));
        let r = store.insert("k", CacheEntry::new("mine"), &owner, &ctx()).unwrap();
        assert!(r.outcome.is_success());
        // Holder write released the lock
        assert!(store.lock_info("k").unwrap().is_none());
    }

    #[test]
    fn test_lock_expiry_lets_writers_in() {
        let store = LocalStore::new();
        put(&store, "k", "v");
        store
            .lock("k", LockId::from("L1"), Some(Duration::from_millis(30)))
            .unwrap();

        let request = LockRequest::with_lock(LockId::from("L2"));
        let blocked = store.insert("k", CacheEntry::new("x"), &request, &ctx()).unwrap();
        assert_eq!(blocked.outcome, OperationOutcome::ItemLocked);

        thread::sleep(Duration::from_millis(60));
        let allowed = store.insert("k", CacheEntry::new("x"), &request, &ctx()).unwrap();
        assert!(allowed.outcome.is_success());
    }
}

// ============================================================================
// Dependencies
// ============================================================================

mod dependencies {
    use super::*;

    #[test]
    fn test_overwrite_returns_dependents_for_cascade() {
        let store = LocalStore::new();
        put(&store, "parent", "p");
        for child in ["b", "c", "d"] {
            store
                .add(
                    child,
                    CacheEntry::new(child).with_dependency(KeyDependency::on(["parent"])),
                    &ctx(),
                )
                .unwrap();
        }

        let r = store
            .insert("parent", CacheEntry::new("p2"), &LockRequest::default(), &ctx())
            .unwrap();
        let previous = r.previous.unwrap();
        let dependents: Vec<_> = previous.dependents.iter().cloned().collect();
        assert_eq!(dependents, vec!["b", "c", "d"]);
        // New parent starts with a clean dependents set
        assert!(store.peek("parent").unwrap().dependents.is_empty());
    }

    #[test]
    fn test_rewiring_dependency_moves_registration() {
        let store = LocalStore::new();
        put(&store, "p1", "a");
        put(&store, "p2", "b");

        store
            .insert(
                "child",
                CacheEntry::new("c").with_dependency(KeyDependency::on(["p1"])),
                &LockRequest::default(),
                &ctx(),
            )
            .unwrap();
        store
            .insert(
                "child",
                CacheEntry::new("c").with_dependency(KeyDependency::on(["p2"])),
                &LockRequest::default(),
                &ctx(),
            )
            .unwrap();

        assert!(store.peek("p1").unwrap().dependents.is_empty());
        assert!(store.peek("p2").unwrap().dependents.contains("child"));
    }

    #[test]
    fn test_remove_cascading_dependencies_returns_removed() {
        let store = LocalStore::new();
        put(&store, "a", "1");
        put(&store, "b", "2");

        let removed = store
            .remove_cascading_dependencies(&["a".to_string(), "ghost".to_string()], &ctx())
            .unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "a");
        assert!(!store.contains("a").unwrap());
        assert!(store.contains("b").unwrap());
    }
}

// ============================================================================
// Expiration
// ============================================================================

mod expiration {
    use super::*;

    #[test]
    fn test_expired_keys_then_remove() {
        let store = LocalStore::new();
        let soon = Timestamp::now().saturating_add(Duration::from_millis(20));
        store
            .add(
                "short",
                CacheEntry::new("v").with_expiration(ExpirationHint::Absolute(soon)),
                &ctx(),
            )
            .unwrap();
        put(&store, "forever", "v");

        assert!(store.expired_keys(Timestamp::now()).is_empty());
        thread::sleep(Duration::from_millis(40));

        let expired = store.expired_keys(Timestamp::now());
        assert_eq!(expired, vec!["short".to_string()]);
        let removed = store
            .remove_bulk(&expired, RemoveReason::Expired, &ctx())
            .unwrap();
        assert!(removed[0].1.outcome.is_success());
        assert_eq!(store.len(), 1);

        // Reported once
        assert!(store.expired_keys(Timestamp::now()).is_empty());
    }
}

// ============================================================================
// Bulk
// ============================================================================

mod bulk {
    use super::*;

    #[test]
    fn test_bulk_outcomes_are_per_key() {
        let store = LocalStore::new();
        put(&store, "taken", "x");

        let items = vec![
            ("fresh".to_string(), CacheEntry::new("a")),
            ("taken".to_string(), CacheEntry::new("b")),
        ];
        let results = store.add_bulk(items, &ctx()).unwrap();
        assert_eq!(results[0].1.outcome, OperationOutcome::Success);
        assert_eq!(results[1].1.outcome, OperationOutcome::KeyExists);
        assert_eq!(value_of(&store, "taken"), Some(Value::from("x")));
    }

    #[test]
    fn test_random_bulk_round() {
        let store = LocalStore::new();
        let mut rng = rand::thread_rng();
        let keys: Vec<String> = (0..64).map(|i| format!("k{}", i)).collect();
        let items: Vec<_> = keys
            .iter()
            .map(|k| (k.clone(), CacheEntry::new(rng.gen::<i64>())))
            .collect();

        let inserted = store.insert_bulk(items, &ctx()).unwrap();
        assert!(inserted.iter().all(|(_, r)| r.outcome.is_success()));
        assert_eq!(store.len(), keys.len());

        let removed = store
            .remove_bulk(&keys[..32], RemoveReason::Removed, &ctx())
            .unwrap();
        assert_eq!(removed.len(), 32);
        assert_eq!(store.len(), 32);
    }
}
