use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;

use shelfstore_core::{Config, FlatStore, KvStore, OpenFlags, Store};

fn random_keys(count: usize) -> Vec<Vec<u8>> {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    (0..count)
        .map(|_| format!("key{:016x}", rng.gen::<u64>()).into_bytes())
        .collect()
}

fn memory_ops(c: &mut Criterion) {
    let keys = random_keys(10_000);
    let store: FlatStore = Store::memory();
    for key in &keys {
        store.put(key, vec![7u8; 100]).unwrap();
    }

    c.bench_function("memory get", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(store.get(&keys[i]).unwrap());
        });
    });

    c.bench_function("memory put overwrite", |b| {
        let mut i = 0;
        b.iter(|| {
            i = (i + 1) % keys.len();
            store.put(&keys[i], black_box(vec![9u8; 100])).unwrap();
        });
    });

    c.bench_function("memory full iteration", |b| {
        b.iter(|| black_box(store.iter().unwrap().count()));
    });

    c.bench_function("memory prefix search", |b| {
        b.iter(|| black_box(store.search_keys(b"key0", Some(100)).unwrap()));
    });
}

fn log_writes(c: &mut Criterion) {
    let keys = random_keys(1_000);
    c.bench_function("buffered log 1k puts", |b| {
        b.iter_batched(
            || {
                let dir = TempDir::new().unwrap();
                let store: FlatStore = Store::open_with(
                    dir.path().join("bench.shelf"),
                    OpenFlags::WRITER | OpenFlags::CREATE,
                    Config::buffered(),
                )
                .unwrap();
                (dir, store)
            },
            |(_dir, store)| {
                for key in &keys {
                    store.put(key, vec![1u8; 64]).unwrap();
                }
                store.sync().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
}

criterion_group!(benches, memory_ops, log_writes);
criterion_main!(benches);
