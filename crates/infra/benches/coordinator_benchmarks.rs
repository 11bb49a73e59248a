use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use stockguard_core::{ActorId, ResourceKey, VersionedRecord};
use stockguard_infra::{ExecuteOptions, InMemoryRecordStore, OperationCoordinator, OperationSigner, RecordStore};
use stockguard_infra::{InMemoryAuditSink, InMemoryAlertSink};
use stockguard_inventory::{MergeStrategy, OperationKind, Policy, PolicyRegistry};

fn key(n: usize) -> ResourceKey {
    ResourceKey::new(format!("SKU-{n}"), "WH-1").unwrap()
}

fn setup(keys: usize, policy: Policy) -> (Arc<OperationCoordinator>, Arc<InMemoryRecordStore>) {
    let store = Arc::new(InMemoryRecordStore::new());
    for n in 0..keys {
        store.insert(key(n), VersionedRecord::new(1_000_000, 1));
    }
    let policies = PolicyRegistry::from_policies([("stock", policy)]).unwrap();
    let signer = OperationSigner::new(b"bench-key").unwrap();
    // In-memory sinks keep tracing output out of the measurements.
    let coord = OperationCoordinator::builder(policies, store.clone(), signer)
        .audit_sink(Arc::new(InMemoryAuditSink::new()))
        .alert_sink(Arc::new(InMemoryAlertSink::new()))
        .build();
    (Arc::new(coord), store)
}

fn options() -> ExecuteOptions {
    ExecuteOptions::new(ActorId::new())
}

/// Latency of one uncontended operation through the full pipeline.
fn bench_uncontended_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("uncontended_execute");

    let (coord, _) = setup(1, Policy::default());
    group.bench_function("increase", |b| {
        b.iter(|| {
            coord
                .execute("stock", key(0), OperationKind::Increase, black_box(1), options())
                .unwrap()
        });
    });

    // Bare CAS write for comparison (no validation, lock, signature or audit).
    let (_, store) = setup(1, Policy::default());
    group.bench_function("raw_cas_write", |b| {
        b.iter(|| {
            let current = store.read(&key(0)).unwrap();
            store
                .write_if_version(&key(0), current.version, black_box(current.quantity + 1))
                .unwrap()
        });
    });

    group.finish();
}

/// Throughput of `threads` writers, all on one key vs one key each.
fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    group.sample_size(20);
    let per_thread = 50usize;

    for threads in [2usize, 4, 8] {
        group.throughput(Throughput::Elements((threads * per_thread) as u64));

        for (label, distinct) in [("same_key", false), ("distinct_keys", true)] {
            group.bench_with_input(BenchmarkId::new(label, threads), &threads, |b, &threads| {
                let policy = Policy::default()
                    .with_merge_strategy(MergeStrategy::Sum)
                    .with_retries(1_000, Duration::from_millis(1))
                    .with_lock_timeout(Duration::from_secs(10));
                let (coord, _) = setup(threads, policy);

                b.iter(|| {
                    let barrier = Arc::new(Barrier::new(threads));
                    let handles: Vec<_> = (0..threads)
                        .map(|t| {
                            let coord = coord.clone();
                            let barrier = barrier.clone();
                            let k = if distinct { key(t) } else { key(0) };
                            thread::spawn(move || {
                                barrier.wait();
                                for _ in 0..per_thread {
                                    coord
                                        .execute("stock", k.clone(), OperationKind::Increase, 1, options())
                                        .unwrap();
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
    }

    group.finish();
}

criterion_group!(benches, bench_uncontended_execute, bench_contention);
criterion_main!(benches);
