//! Benchmarks for the record store save/get path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deskvault_common::{Record, RecordId, SystemClock};
use deskvault_config::VaultConfig;
use deskvault_core::RecordStore;
use deskvault_storage::MemoryBackend;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn store() -> RecordStore {
    let config = VaultConfig::default();
    RecordStore::new(
        Arc::new(MemoryBackend::new(config.storage.max_value_bytes)),
        &config,
        Arc::new(SystemClock),
    )
    .unwrap()
}

fn ticket(i: u64, body_bytes: usize) -> Record {
    Record::new(RecordId::new(format!("T-{}", i)).unwrap())
        .with_field("status", "open")
        .with_field("createdAt", i)
        .with_field("body", "x".repeat(body_bytes))
}

fn bench_save(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("record_save");

    // Inline, just over one chunk, and several chunks.
    for body in [512, 9_000, 30_000] {
        group.bench_with_input(BenchmarkId::from_parameter(body), &body, |b, &body| {
            let store = store();
            let next = AtomicU64::new(0);
            b.to_async(&rt).iter(|| {
                let i = next.fetch_add(1, Ordering::Relaxed) % 500;
                let record = ticket(i, body);
                let store = &store;
                async move { black_box(store.save(record).await.unwrap()) }
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("record_get");

    for body in [512, 30_000] {
        let store = store();
        rt.block_on(async {
            for i in 0..100 {
                store.save(ticket(i, body)).await.unwrap();
            }
        });
        let ids: Vec<RecordId> = (0..100)
            .map(|i| RecordId::new(format!("T-{}", i)).unwrap())
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(body), &body, |b, _| {
            let next = AtomicU64::new(0);
            b.to_async(&rt).iter(|| {
                let id = &ids[(next.fetch_add(1, Ordering::Relaxed) % 100) as usize];
                let store = &store;
                async move { black_box(store.get(id).await.unwrap()) }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_save, bench_get);
criterion_main!(benches);
