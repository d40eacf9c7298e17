//! Benchmarks for absent-path cache lookups.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tiercache::cache::{
    AbsentCacheOptions, AbsentPathCache, AsyncAbsentPathCache, NoopAbsentPathCache,
};
use tiercache::ufs::local::LocalUnderFileSystem;

fn bench_absent_lookups(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let dir = tempfile::tempdir().unwrap();
    let cache = AsyncAbsentPathCache::new(
        Arc::new(LocalUnderFileSystem::new(dir.path())),
        2,
        AbsentCacheOptions::default(),
    );

    // 10,000 absent directories, each looked up through a deep child.
    for i in 0..10_000 {
        cache.add_single_path(&format!("/warehouse/table_{i}"));
    }

    c.bench_function("absent_hit_depth_6", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            let path = format!("/warehouse/table_{i}/year=2024/month=01/part-0000");
            black_box(cache.is_absent(black_box(&path)))
        })
    });

    cache.process_existence("/warehouse/known/file");
    c.bench_function("present_lookup", |b| {
        b.iter(|| black_box(cache.is_absent(black_box("/warehouse/known/file"))))
    });

    let noop = NoopAbsentPathCache;
    c.bench_function("noop_lookup", |b| {
        b.iter(|| black_box(noop.is_absent(black_box("/warehouse/table_1/part"))))
    });
}

criterion_group!(benches, bench_absent_lookups);
criterion_main!(benches);
