//! Performance benchmarks for tandem-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use tandem_engine::{
    ConflictResolver, Fields, MergeStrategy, Record, ReplicaStore, StoreSnapshot, VectorClock,
};

fn wide_clock(devices: usize, offset: u64) -> VectorClock {
    VectorClock::from_counters((0..devices).map(|i| (format!("device-{i}"), i as u64 + offset)))
}

fn payload(i: u64) -> Fields {
    json!({"title": format!("Item {i}"), "completed": false, "priority": i % 5})
        .as_object()
        .cloned()
        .unwrap()
}

fn bench_clock_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("clock_operations");

    for devices in [4usize, 32, 256] {
        let a = wide_clock(devices, 1);
        let b = wide_clock(devices, 2).increment("device-0");

        group.bench_with_input(BenchmarkId::new("compare", devices), &devices, |bench, _| {
            bench.iter(|| black_box(&a).compare(black_box(&b)))
        });

        group.bench_with_input(BenchmarkId::new("merge", devices), &devices, |bench, _| {
            bench.iter(|| black_box(&a).merge(black_box(&b)))
        });
    }

    group.finish();
}

fn bench_resolver(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolver");
    let resolver = ConflictResolver::new("A", MergeStrategy::Manual);

    let base = Record::new("item", payload(1), "A", 1000);
    let mut newer = base.clone();
    newer.edit("B", payload(2), 2000);
    let mut local = base.clone();
    local.edit("A", payload(3), 2000);

    group.bench_function("resolve_sequential", |b| {
        b.iter(|| resolver.resolve(black_box(Some(&base)), black_box(&newer), 3000))
    });

    group.bench_function("resolve_concurrent", |b| {
        b.iter(|| resolver.resolve(black_box(Some(&local)), black_box(&newer), 3000))
    });

    group.finish();
}

fn bench_snapshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("snapshot");

    for size in [100u64, 1000] {
        let mut store = ReplicaStore::new("A");
        for i in 0..size {
            // ids are unique so create cannot fail
            let _ = store.create(format!("item-{i}"), payload(i), 1000 + i);
        }
        let json = store.export_snapshot().to_json().unwrap();

        group.bench_with_input(BenchmarkId::new("export", size), &size, |b, _| {
            b.iter(|| store.export_snapshot())
        });

        group.bench_with_input(BenchmarkId::new("from_json", size), &size, |b, _| {
            b.iter(|| StoreSnapshot::from_json(black_box(&json)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_clock_operations, bench_resolver, bench_snapshot);
criterion_main!(benches);
