use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde::{Deserialize, Serialize};
use slotdb::{BufferMode, Collection, StoreOptions};

#[derive(Clone, Serialize, Deserialize)]
struct Doc {
    name: String,
    score: u64,
}

fn opts(dir: &std::path::Path, mode: BufferMode) -> StoreOptions {
    StoreOptions {
        base_directory: dir.to_string_lossy().into_owned(),
        database_name: "bench".into(),
        buffer_mode: mode,
        ..StoreOptions::default()
    }
}

fn bench_store(c: &mut Criterion) {
    let doc = Doc { name: "benchmark".into(), score: 7 };

    c.bench_function("add_or_update_disabled", |b| {
        let dir = tempfile::tempdir().unwrap();
        let col: Collection<u64, Doc> =
            Collection::open("docs", opts(dir.path(), BufferMode::Disabled)).unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            col.add_or_update(black_box(i % 1024), doc.clone()).unwrap()
        });
    });

    c.bench_function("add_or_update_parallel_buffered", |b| {
        let dir = tempfile::tempdir().unwrap();
        let col: Collection<u64, Doc> =
            Collection::open("docs", opts(dir.path(), BufferMode::ParallelBuffered)).unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            col.add_or_update(black_box(i % 1024), doc.clone()).unwrap()
        });
        col.flush().unwrap();
    });

    c.bench_function("get_hot_key", |b| {
        let dir = tempfile::tempdir().unwrap();
        let col: Collection<u64, Doc> =
            Collection::open("docs", opts(dir.path(), BufferMode::Disabled)).unwrap();
        col.add(1, doc.clone()).unwrap();
        b.iter(|| col.get(black_box(&1)).unwrap());
    });
}

criterion_group!(benches, bench_store);
criterion_main!(benches);
