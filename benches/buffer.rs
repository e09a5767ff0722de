use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kuba_tally::buffer::{Buffer, BufferConfig, BufferQueue, QueueMode};
use kuba_tally::driver::{MemoryDriver, StorageDriver};
use kuba_tally::time::{Granularity, TimeBucketer};
use kuba_tally::types::{Operation, Values};
use std::sync::Arc;

fn keys(bucketer: &TimeBucketer, metric: usize) -> Vec<kuba_tally::BucketKey> {
    let at = Utc.with_ymd_and_hms(2024, 4, 9, 13, 37, 0).unwrap();
    let name = format!("metric_{}", metric);
    [Granularity::Hour, Granularity::Day, Granularity::Month]
        .iter()
        .map(|g| bucketer.bucket_key(&name, at, *g))
        .collect()
}

fn bench_queue_store(c: &mut Criterion) {
    let bucketer = TimeBucketer::default();
    let values = Values::new()
        .with("hits", 1)
        .with("status", Values::new().with("ok", 1));
    let mut group = c.benchmark_group("queue_store");

    for (label, mode) in [("linear", QueueMode::Linear), ("aggregating", QueueMode::Aggregating)] {
        for metrics in [1usize, 16, 256] {
            let key_sets: Vec<_> = (0..metrics).map(|m| keys(&bucketer, m)).collect();
            group.bench_with_input(BenchmarkId::new(label, metrics), &key_sets, |b, key_sets| {
                b.iter(|| {
                    let mut queue = BufferQueue::new(mode);
                    for i in 0..1_000 {
                        let keys = key_sets[i % key_sets.len()].clone();
                        queue.store(Operation::Inc, keys, &values).unwrap();
                    }
                    black_box(queue.drain())
                })
            });
        }
    }

    group.finish();
}

fn bench_buffered_track(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let bucketer = TimeBucketer::default();
    let key_sets: Vec<_> = (0..16).map(|m| keys(&bucketer, m)).collect();
    let values = Values::new().with("hits", 1);
    let mut group = c.benchmark_group("buffered_inc");

    let key_sets = &key_sets;
    let values = &values;

    for (label, aggregate) in [("linear", false), ("aggregating", true)] {
        group.bench_function(label, |b| {
            b.to_async(&runtime).iter(move || async move {
                let driver = Arc::new(MemoryDriver::new());
                let buffer = Buffer::new(driver, BufferConfig::synchronous(100, aggregate)).unwrap();
                for i in 0..1_000 {
                    buffer.inc(&key_sets[i % key_sets.len()], values).await.unwrap();
                }
                buffer.shutdown().await.unwrap();
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_queue_store, bench_buffered_track);
criterion_main!(benches);
