use std::sync::Arc;

use burrow::{Store, StrType, U64Type};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

fn bench_put(c: &mut Criterion) {
    c.bench_function("put_10k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let store = Store::builder()
                    .path(dir.path().join("bench.db"))
                    .open()
                    .unwrap();
                let map = store
                    .open_map(1, Arc::new(U64Type), Arc::new(StrType))
                    .unwrap();
                (dir, store, map)
            },
            |(_dir, _store, map)| {
                for i in 0..10_000u64 {
                    map.put(i, format!("value-{}", i)).unwrap();
                }
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_get(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::builder()
        .path(dir.path().join("bench.db"))
        .open()
        .unwrap();
    let map = store
        .open_map(1, Arc::new(U64Type), Arc::new(StrType))
        .unwrap();
    for i in 0..100_000u64 {
        map.put(i, format!("value-{}", i)).unwrap();
    }
    store.commit().unwrap();

    let mut i = 0u64;
    c.bench_function("get_cached", |b| {
        b.iter(|| {
            i = (i + 7919) % 100_000;
            map.get(&i).unwrap()
        })
    });
}

fn bench_commit(c: &mut Criterion) {
    c.bench_function("commit_1k", |b| {
        b.iter_batched(
            || {
                let dir = tempfile::tempdir().unwrap();
                let store = Store::builder()
                    .path(dir.path().join("bench.db"))
                    .open()
                    .unwrap();
                let map = store
                    .open_map(1, Arc::new(U64Type), Arc::new(StrType))
                    .unwrap();
                for i in 0..1_000u64 {
                    map.put(i, format!("value-{}", i)).unwrap();
                }
                (dir, store, map)
            },
            |(_dir, store, _map)| store.commit().unwrap(),
            BatchSize::LargeInput,
        )
    });
}

criterion_group!(benches, bench_put, bench_get, bench_commit);
criterion_main!(benches);
