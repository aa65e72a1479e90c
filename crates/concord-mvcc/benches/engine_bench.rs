//! Criterion micro-benchmarks for the concurrency-control engine.
//!
//! Benchmarks:
//! - Row lock acquire/release latency
//! - Version arena alloc/free cycle
//! - Snapshot reads over long version chains
//! - Commit path per isolation level
//! - Wait-for graph cycle search
//! - Contended increments across threads

use std::hint::black_box;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use concord_mvcc::{
    CommitTs, EngineConfig, IsolationLevel, LockManager, LockMode, LockResource,
    NullDurabilityLog, Payload, RowKey, TableId, TransactionManager, TxnId, Version, VersionArena,
    VersionStore, WaitForGraph,
};
use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

fn criterion_config() -> Criterion {
    Criterion::default().configure_from_args()
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn txn(n: u64) -> TxnId {
    TxnId::new(n).unwrap()
}

fn row(k: u64) -> RowKey {
    RowKey::new(TableId::new(1), k)
}

fn engine() -> TransactionManager {
    let config = EngineConfig {
        auto_gc: false,
        ..EngineConfig::default()
    };
    TransactionManager::new(config, Arc::new(NullDurabilityLog)).unwrap()
}

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

fn bench_lock_acquire_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_manager/acquire_release");
    group.throughput(Throughput::Elements(1));

    for mode in [LockMode::Shared, LockMode::Exclusive] {
        group.bench_function(format!("{mode:?}"), |b| {
            let lm = LockManager::new();
            let t = txn(1);
            b.iter(|| {
                black_box(lm.acquire(t, LockResource::Row(row(42)), mode, Duration::ZERO));
                lm.release_all(t);
            });
        });
    }

    group.finish();
}

fn bench_lock_many_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("lock_manager/many_rows");
    group.sample_size(30);

    for &n in &[100_u64, 1_000, 10_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::new("rows", n), &n, |b, &n| {
            b.iter_batched(
                LockManager::new,
                |lm| {
                    for k in 0..n {
                        let resource = LockResource::Row(row(k));
                        lm.acquire(txn(1), resource, LockMode::Exclusive, Duration::ZERO);
                    }
                    lm.release_all(txn(1))
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Version store
// ---------------------------------------------------------------------------

fn bench_arena_alloc_free(c: &mut Criterion) {
    let mut group = c.benchmark_group("version_arena/alloc_free");
    group.throughput(Throughput::Elements(1));

    group.bench_function("cycle", |b| {
        let mut arena = VersionArena::new();
        let payload = Payload::from_i64(7);
        b.iter(|| {
            let idx = arena.alloc(Version::pending(row(1), payload.clone(), txn(1)));
            black_box(arena.free(idx));
        });
    });

    group.finish();
}

fn bench_snapshot_read_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("version_store/read_chain");

    for &depth in &[1_u64, 16, 256] {
        let store = VersionStore::new();
        for ts in 1..=depth {
            let h = store.write(row(1), txn(ts), Payload::from_i64(ts as i64)).unwrap();
            store.finalize(h, CommitTs::new(ts));
        }
        group.bench_with_input(BenchmarkId::new("oldest", depth), &depth, |b, _| {
            b.iter(|| black_box(store.read(row(1), CommitTs::new(1))));
        });
        group.bench_with_input(BenchmarkId::new("newest", depth), &depth, |b, &d| {
            b.iter(|| black_box(store.read(row(1), CommitTs::new(d))));
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Transaction manager
// ---------------------------------------------------------------------------

fn bench_commit_path(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction_manager/commit");
    group.throughput(Throughput::Elements(1));

    for level in [
        IsolationLevel::ReadCommitted,
        IsolationLevel::RepeatableRead,
        IsolationLevel::Serializable,
    ] {
        group.bench_function(level.to_string(), |b| {
            let tm = engine();
            let mut k = 0_u64;
            b.iter(|| {
                k = (k + 1) % 1024;
                let t = tm.begin(level).unwrap();
                let _ = tm.read(t, row(k), false).unwrap();
                tm.write(t, row(k), Payload::from_i64(1)).unwrap();
                black_box(tm.commit(t).unwrap());
            });
            tm.collect_garbage();
        });
    }

    group.finish();
}

fn bench_contended_increments(c: &mut Criterion) {
    let mut group = c.benchmark_group("transaction_manager/contended");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for &threads in &[2_usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * 100) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &n| {
            b.iter(|| {
                let tm = Arc::new(engine());
                let barrier = Arc::new(Barrier::new(n));
                let handles: Vec<_> = (0..n)
                    .map(|_| {
                        let tm = Arc::clone(&tm);
                        let barrier = Arc::clone(&barrier);
                        thread::spawn(move || {
                            barrier.wait();
                            let mut done = 0;
                            while done < 100 {
                                let t = tm.begin(IsolationLevel::RepeatableRead).unwrap();
                                let step = tm
                                    .read(t, row(0), true)
                                    .and_then(|v| {
                                        let n = v.and_then(|p| p.as_i64()).unwrap_or(0);
                                        tm.write(t, row(0), Payload::from_i64(n + 1))
                                    })
                                    .and_then(|()| tm.commit(t));
                                if step.is_ok() {
                                    done += 1;
                                }
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

// ---------------------------------------------------------------------------
// Deadlock detection
// ---------------------------------------------------------------------------

fn bench_cycle_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("deadlock/cycle_search");

    for &n in &[8_u64, 64, 512] {
        let mut ring = WaitForGraph::new();
        let mut chain = WaitForGraph::new();
        for i in 1..n {
            ring.add_edge(txn(i), txn(i + 1));
            chain.add_edge(txn(i), txn(i + 1));
        }
        ring.add_edge(txn(n), txn(1));

        group.bench_with_input(BenchmarkId::new("ring", n), &n, |b, _| {
            b.iter(|| black_box(ring.find_cycle_from(txn(1), 1024)));
        });
        group.bench_with_input(BenchmarkId::new("chain", n), &n, |b, _| {
            b.iter(|| black_box(chain.find_cycle_from(txn(1), 1024)));
        });
    }

    group.finish();
}

criterion_group!(
    name = lock_manager;
    config = criterion_config();
    targets =
        bench_lock_acquire_release,
        bench_lock_many_rows
);

criterion_group!(
    name = version_store;
    config = criterion_config();
    targets =
        bench_arena_alloc_free,
        bench_snapshot_read_chain
);

criterion_group!(
    name = transaction_manager;
    config = criterion_config();
    targets =
        bench_commit_path,
        bench_contended_increments
);

criterion_group!(
    name = deadlock;
    config = criterion_config();
    targets =
        bench_cycle_search
);

criterion_main!(lock_manager, version_store, transaction_manager, deadlock);
