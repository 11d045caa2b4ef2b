//! Benchmarks for sentinel handoff.

use beamflow::sentinel::{FileSentinelStore, InMemorySentinelStore, SentinelStore};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tokio::runtime::Runtime;

async fn post_take(store: &dyn SentinelStore, name: &str) {
    store.post(name).await.unwrap();
    assert!(store.take(name).await.unwrap());
}

async fn post_claim_release(store: &dyn SentinelStore, name: &str) {
    store.post(name).await.unwrap();
    assert!(store.claim(name).await.unwrap());
    store.release(name).await.unwrap();
}

fn sentinel_benchmark(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let memory = InMemorySentinelStore::new();
    c.bench_function("memory_post_take", |b| {
        b.iter(|| rt.block_on(post_take(&memory, black_box("ready:a"))));
    });

    let dir = tempfile::tempdir().unwrap();
    let fs = rt.block_on(FileSentinelStore::create(dir.path())).unwrap();
    c.bench_function("fs_post_take", |b| {
        b.iter(|| rt.block_on(post_take(&fs, black_box("ready:a"))));
    });

    c.bench_function("fs_post_claim_release", |b| {
        b.iter(|| rt.block_on(post_claim_release(&fs, black_box("ready:a"))));
    });

    for i in 0..100 {
        rt.block_on(fs.post(&format!("ready:task{i}"))).unwrap();
    }
    c.bench_function("fs_pending_100", |b| {
        b.iter(|| rt.block_on(fs.pending(black_box("ready:"))).unwrap());
    });
}

criterion_group!(benches, sentinel_benchmark);
criterion_main!(benches);
