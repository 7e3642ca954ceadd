//! Cache Performance Benchmarks
//!
//! Hot-path costs of the memory tier and the optimization service:
//! - Page cache hit lookup
//! - Page insert with eviction under a tight budget
//! - Predictive preload selection with a learned pattern
//!
//! Run with: `cargo bench --bench cache_performance`

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use amnesia_render::cache::{CacheConfig, DocumentCacheManager};
use amnesia_render::optimization::{BehaviorUpdate, CacheOptimizationService, OptimizationConfig};

const PAGE_BYTES: usize = 64 * 1024;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

fn bench_page_cache(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("page_cache");
    group.measurement_time(Duration::from_secs(10));
    group.sample_size(50);

    let cache = DocumentCacheManager::new(CacheConfig::default());
    rt.block_on(async {
        for page in 1..=100 {
            cache
                .set_page_cache("doc", page, vec![0u8; PAGE_BYTES], "image/png", 1)
                .await;
        }
    });

    group.bench_function("get_hit", |b| {
        let mut page = 0u32;
        b.iter(|| {
            page = page % 100 + 1;
            rt.block_on(cache.get_page_cache(black_box("doc"), black_box(page)))
        });
    });

    // Budget of 16 pages: every insert past the 16th evicts
    let tight = DocumentCacheManager::new(CacheConfig {
        max_memory_bytes: 16 * PAGE_BYTES,
        ..CacheConfig::default()
    });
    group.bench_function("insert_with_eviction", |b| {
        let mut page = 0u32;
        b.iter(|| {
            page = page.wrapping_add(1);
            rt.block_on(tight.set_page_cache(
                "doc",
                page,
                vec![0u8; PAGE_BYTES],
                "image/png",
                1,
            ))
        });
    });

    group.finish();
}

fn bench_predictive_preload(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("optimization");
    group.measurement_time(Duration::from_secs(10));

    let cache = DocumentCacheManager::new(CacheConfig::default());
    let service = CacheOptimizationService::new(cache, OptimizationConfig::default(), None);
    for round in 0..50u32 {
        for page in 1..=20 {
            service.update_user_behavior_pattern(BehaviorUpdate::new(
                "reader",
                "doc",
                (page * 7 + round) % 200 + 1,
            ));
        }
    }

    group.bench_function("predictive_preload", |b| {
        b.iter(|| {
            rt.block_on(service.predictive_preload(
                black_box("doc"),
                black_box(8),
                Some("reader"),
            ))
        });
    });

    group.finish();
}

criterion_group!(benches, bench_page_cache, bench_predictive_preload);
criterion_main!(benches);
