//! Concurrent tests for tessera-concurrency
//!
//! The controller holds no locks itself, so these tests wrap a single key in a
//! mutex (the shape every storage engine provides) and race real threads
//! through `evaluate_write` to check:
//!
//! 1. **No lost updates** - every committed write gets a distinct version
//! 2. **Version monotonicity** - committed versions strictly increase
//! 3. **Lock exclusivity** - exactly one concurrent `Acquire` wins
//! 4. **PreserveVersion races** - stale writers fail with `VersionMismatch`

use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use tessera_concurrency::{Decision, LockController, LockIdGenerator, VersionStamper};
use tessera_core::{
    CacheEntry, LockId, LockRequest, OperationOutcome, Timestamp,
};

// ============================================================================
// Test Helpers
// ============================================================================

struct Slot {
    entry: Mutex<Option<CacheEntry>>,
    controller: LockController,
}

impl Slot {
    fn new() -> Arc<Self> {
        Arc::new(Slot {
            entry: Mutex::new(None),
            controller: LockController::new(
                LockIdGenerator::with_host("test"),
                VersionStamper::default(),
            ),
        })
    }

    /// Evaluate and apply under the slot lock, returning the committed version.
    fn write(&self, value: &str, request: &LockRequest) -> Result<(u64, Option<LockId>), OperationOutcome> {
        let mut guard = self.entry.lock();
        let now = Timestamp::now();
        match self
            .controller
            .evaluate_write("k", guard.as_ref(), None, request, now)
        {
            Decision::Proceed {
                version,
                lock,
                granted,
            } => {
                let mut entry = CacheEntry::new(value);
                entry.version = version;
                entry.lock = lock;
                *guard = Some(entry);
                Ok((version, granted.map(|g| g.lock_id)))
            }
            Decision::Reject(outcome) => Err(outcome),
        }
    }

    fn version(&self) -> Option<u64> {
        self.entry.lock().as_ref().map(|e| e.version)
    }
}

// ============================================================================
// Concurrent writers
// ============================================================================

#[test]
fn test_concurrent_inserts_get_distinct_versions() {
    const THREADS: usize = 8;
    const WRITES: usize = 200;

    let slot = Slot::new();
    let barrier = Arc::new(Barrier::new(THREADS));
    let versions = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let slot = Arc::clone(&slot);
            let barrier = Arc::clone(&barrier);
            let versions = Arc::clone(&versions);
            thread::spawn(move || {
                barrier.wait();
                let mut local = Vec::with_capacity(WRITES);
                for i in 0..WRITES {
                    let (v, _) = slot
                        .write(&format!("{}-{}", t, i), &LockRequest::default())
                        .unwrap();
                    local.push(v);
                }
                // Each thread sees its own writes in increasing order
                assert!(local.windows(2).all(|w| w[0] < w[1]));
                versions.lock().extend(local);
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let all = versions.lock();
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(unique.len(), THREADS * WRITES, "no two writes share a version");
    assert_eq!(slot.version(), all.iter().max().copied());
}

#[test]
fn test_only_one_acquire_wins() {
    const THREADS: usize = 16;

    let slot = Slot::new();
    slot.write("seed", &LockRequest::default()).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let winners = Arc::new(AtomicUsize::new(0));
    let locked_out = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let slot = Arc::clone(&slot);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            let locked_out = Arc::clone(&locked_out);
            thread::spawn(move || {
                barrier.wait();
                match slot.write("mine", &LockRequest::acquire(None)) {
                    Ok((_, Some(_))) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(OperationOutcome::ItemLocked) => {
                        locked_out.fetch_add(1, Ordering::SeqCst);
                    }
                    other => panic!("unexpected {:?}", other),
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    assert_eq!(locked_out.load(Ordering::SeqCst), THREADS - 1);
}

#[test]
fn test_preserve_version_race_never_loses_data() {
    const THREADS: usize = 8;

    let slot = Slot::new();
    let (start, _) = slot.write("seed", &LockRequest::default()).unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let committed = Arc::new(AtomicUsize::new(0));
    let mismatched = Arc::new(AtomicUsize::new(0));

    // Every thread read the same version; only one may apply on top of it.
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let slot = Arc::clone(&slot);
            let barrier = Arc::clone(&barrier);
            let committed = Arc::clone(&committed);
            let mismatched = Arc::clone(&mismatched);
            thread::spawn(move || {
                barrier.wait();
                match slot.write("cas", &LockRequest::preserve_version(start)) {
                    Ok(_) => committed.fetch_add(1, Ordering::SeqCst),
                    Err(OperationOutcome::VersionMismatch) => mismatched.fetch_add(1, Ordering::SeqCst),
                    Err(other) => panic!("unexpected {:?}", other),
                };
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(committed.load(Ordering::SeqCst), 1);
    assert_eq!(mismatched.load(Ordering::SeqCst), THREADS - 1);
    assert_eq!(slot.version(), Some(start + 1));
}

#[test]
fn test_lock_ids_unique_across_threads() {
    let ids = Arc::new(LockIdGenerator::with_host("h"));
    let seen = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ids = Arc::clone(&ids);
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for _ in 0..500 {
                    assert!(seen.lock().insert(ids.next("same-key")));
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(seen.lock().len(), 2_000);
}

// ============================================================================
// Properties
// ============================================================================

#[derive(Debug, Clone)]
enum Op {
    Plain,
    Preserve { stale: bool },
    Assigned { bump: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        Just(Op::Plain),
        any::<bool>().prop_map(|stale| Op::Preserve { stale }),
        (0u64..5).prop_map(|bump| Op::Assigned { bump }),
    ]
}

proptest! {
    #[test]
    fn prop_successful_writes_strictly_increase(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let slot = Slot::new();
        let mut last: Option<u64> = None;

        for op in ops {
            let current = slot.version();
            let request = match op {
                Op::Plain => LockRequest::default(),
                Op::Preserve { stale } => {
                    let expected = current.unwrap_or(0);
                    LockRequest::preserve_version(if stale { expected.wrapping_add(1) } else { expected })
                }
                Op::Assigned { bump } => {
                    LockRequest::default().with_assigned_version(current.unwrap_or(0) + bump)
                }
            };

            match slot.write("v", &request) {
                Ok((version, _)) => {
                    if let Some(prev) = last {
                        prop_assert!(version > prev);
                    }
                    last = Some(version);
                }
                Err(outcome) => {
                    prop_assert_eq!(outcome, OperationOutcome::VersionMismatch);
                    // Rejected writes leave the stored version alone
                    prop_assert_eq!(slot.version(), current);
                }
            }
        }
    }
}
