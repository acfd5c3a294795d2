//! Facade Tax Benchmarks
//!
//! Measures overhead at each layer:
//! - A1: Storage layer (LocalStore insert/get direct)
//! - B:  Facade layer (EntryStore insert/get with admission, stats, pool)
//! - C:  Facade with locking (lock / insert as holder / unlock)
//!
//! Run with: cargo bench --bench entry_store

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tessera::storage::LocalStore;
use tessera::{
    CacheConfig, CacheEntry, CacheImpl, CacheStats, EntryStore, InsertOptions, LockRequest,
    OperationContext, RemoveOptions, StatsCollector, Value,
};

fn facade() -> EntryStore {
    let store = EntryStore::builder(CacheConfig::default().with_name("bench"))
        .stats(Arc::new(CacheStats::new()) as Arc<dyn StatsCollector>)
        .build()
        .expect("build store");
    store.start().expect("start store");
    store
}

/// A1: storage engine without the facade
fn bench_a1_storage(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_store/A1");
    group.measurement_time(Duration::from_secs(5));

    let storage = LocalStore::new();
    let ctx = OperationContext::new();
    let request = LockRequest::ignore_lock();

    group.bench_function("storage_insert", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            storage
                .insert(&format!("key{}", i % 10_000), CacheEntry::new(i as i64), &request, &ctx)
                .unwrap()
        });
    });

    group.bench_function("storage_get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            storage.get(&format!("key{}", i), &request, &ctx).unwrap()
        });
    });

    group.finish();
}

/// B: the full facade write and read paths
fn bench_b_facade(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_store/B");
    group.measurement_time(Duration::from_secs(5));

    let store = facade();

    group.bench_function("facade_insert", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store
                .insert(&format!("key{}", i % 10_000), i as i64, InsertOptions::default())
                .unwrap()
        });
    });

    group.bench_function("facade_get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            store.get(&format!("key{}", i)).unwrap()
        });
    });

    group.bench_function("facade_insert_remove", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            let key = format!("churn{}", i);
            store.insert(&key, i as i64, InsertOptions::default()).unwrap();
            store.remove(&key, RemoveOptions::default()).unwrap()
        });
    });

    group.finish();
}

/// C: lock round trips at different value sizes
fn bench_c_locking(c: &mut Criterion) {
    let mut group = c.benchmark_group("entry_store/C");
    group.measurement_time(Duration::from_secs(5));

    let store = facade();
    for size in [16usize, 1024, 16 * 1024] {
        let key = format!("locked{}", size);
        store
            .insert(&key, Value::Bytes(vec![0u8; size]), InsertOptions::default())
            .unwrap();

        group.bench_with_input(BenchmarkId::new("lock_write_unlock", size), &size, |b, &size| {
            b.iter(|| {
                let lock = store.lock(&key, None).unwrap().lock_id.unwrap();
                store
                    .insert(
                        &key,
                        Value::Bytes(vec![1u8; size]),
                        InsertOptions::default().locked_by(lock),
                    )
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_a1_storage, bench_b_facade, bench_c_locking);
criterion_main!(benches);
