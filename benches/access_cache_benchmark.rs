use chrono::{Duration as ChronoDuration, Utc};
use course_enrollment::models::enrollment::merge_enrollments;
use course_enrollment::models::{Enrollment, EnrollmentKey};
use course_enrollment::services::AccessCache;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::time::Duration;

fn benchmark_access_cache(c: &mut Criterion) {
    let cache = AccessCache::new(Duration::from_secs(300), 10_000);
    let denied = cache_seed_decision();
    for user in 0..5_000 {
        cache.insert(&format!("user-{user}"), "course-x", denied.clone());
    }

    let mut group = c.benchmark_group("access_cache");

    group.bench_function("hit", |b| {
        b.iter(|| cache.get(black_box("user-2500"), black_box("course-x")))
    });

    group.bench_function("miss", |b| {
        b.iter(|| cache.get(black_box("user-99999"), black_box("course-x")))
    });

    // Full cache: every insert has to evict.
    let full = AccessCache::new(Duration::from_secs(300), 1_000);
    for user in 0..1_000 {
        full.insert(&format!("user-{user}"), "course-x", denied.clone());
    }
    let mut next = 1_000u32;
    group.bench_function("insert_with_eviction", |b| {
        b.iter(|| {
            next += 1;
            full.insert(&format!("user-{next}"), "course-x", denied.clone());
        })
    });

    group.finish();
}

fn benchmark_merge(c: &mut Criterion) {
    let key = EnrollmentKey::new("u1", "course-x").expect("valid key");
    let start = Utc::now();

    // Many legacy records for one pair, each with a few lessons.
    let records: Vec<Enrollment> = (0..50)
        .map(|i| {
            let mut e = Enrollment::new_active(&key, None, start + ChronoDuration::minutes(i));
            e.id = format!("legacy-{i}");
            for l in 0..5 {
                e.completed_lessons.insert(format!("lesson-{}", (i * 3 + l) % 120));
            }
            e
        })
        .collect();

    c.bench_function("merge_50_legacy_enrollments", |b| {
        b.iter(|| merge_enrollments(black_box(&key), black_box(&records)))
    });
}

/// A cached decision to fill the cache with: the resolver only produces
/// these through the store, so take a denial from an empty in-memory one.
fn cache_seed_decision() -> course_enrollment::services::AccessDecision {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    runtime.block_on(async {
        let store = std::sync::Arc::new(course_enrollment::db::InMemoryStore::new());
        let cache = std::sync::Arc::new(AccessCache::new(Duration::from_secs(1), 1));
        let resolver = course_enrollment::services::AccessResolver::new(
            store,
            cache,
            Duration::from_secs(1),
        );
        resolver
            .has_access("seed-user", "course-x")
            .await
            .expect("valid ids")
    })
}

criterion_group!(benches, benchmark_access_cache, benchmark_merge);
criterion_main!(benches);
