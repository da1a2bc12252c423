//! Performance benchmarks for the change feed.

use changefeed::{ChangeInput, FileMeta, Logic, MemoryMeta, Meta, SqlMeta};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tempfile::TempDir;

fn input(n: u64) -> ChangeInput {
    ChangeInput::new(format!("item-{}", n))
        .with_service_name("timers")
        .with_type("timer")
        .with_action("tick")
}

/// Benchmark upsert with fan-out to a varying number of registrations
fn bench_upsert_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("upsert_fan_out");

    for registrations in [0, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("registrations", registrations),
            &registrations,
            |b, &count| {
                let logic = Logic::new(Arc::new(MemoryMeta::new()));
                for r in 0..count {
                    logic.registration_upsert(&format!("r{}", r)).unwrap();
                }

                let mut n = 0u64;
                b.iter(|| {
                    n += 1;
                    black_box(logic.change_upsert(input(n)).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the same workload across backends
fn bench_backends(c: &mut Criterion) {
    let mut group = c.benchmark_group("backend_upsert_ack");
    group.sample_size(20);

    let dir = TempDir::new().unwrap();
    let backends: Vec<(&str, Arc<dyn Meta>)> = vec![
        ("memory", Arc::new(MemoryMeta::new())),
        (
            "file",
            Arc::new(FileMeta::open(dir.path().join("bench.snapshot"), true).unwrap()),
        ),
        ("sql", Arc::new(SqlMeta::in_memory().unwrap())),
    ];

    for (name, meta) in backends {
        let logic = Logic::new(meta);
        logic.registration_upsert("r1").unwrap();

        let mut n = 0u64;
        group.bench_function(name, |b| {
            b.iter(|| {
                n += 1;
                let change = logic.change_upsert(input(n)).unwrap();
                logic
                    .registration_change_acknowledge("r1", &[change.id])
                    .unwrap();
            });
        });
    }

    group.finish();
}

/// Benchmark broadcast with slow live handlers attached
fn bench_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for handlers in [1, 10, 50] {
        group.bench_with_input(BenchmarkId::new("handlers", handlers), &handlers, |b, &count| {
            let logic = Logic::new(Arc::new(MemoryMeta::new()));
            for _ in 0..count {
                logic
                    .handler_create(|change| {
                        black_box(change);
                    })
                    .unwrap();
            }

            let mut n = 0u64;
            b.iter(|| {
                n += 1;
                black_box(logic.change_upsert(input(n)).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_upsert_fan_out, bench_backends, bench_broadcast);
criterion_main!(benches);
