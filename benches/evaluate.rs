use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hallpass::{EndpointClass, FailOpenMode, Identity, RateLimitEngine, Role};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

fn bench_evaluate(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let mut group = c.benchmark_group("evaluate");

    // Rotating through 64 admin principals.
    group.bench_function("rotating_principals", |b| {
        let engine = RateLimitEngine::builder().build();
        let callers: Vec<Identity> = (0..64)
            .map(|i| Identity::new(&format!("10.0.{}.{}", i / 256, i % 256), Some("1"), Role::Admin))
            .collect();
        let next = AtomicU64::new(0);
        b.to_async(&rt).iter(|| {
            let i = next.fetch_add(1, Ordering::Relaxed) as usize % callers.len();
            let engine = engine.clone();
            let caller = callers[i].clone();
            async move {
                black_box(engine.evaluate(&caller, EndpointClass::Read).await);
            }
        })
    });

    // A single principal hammering a full window: every call is a rejection.
    group.bench_function("rejected", |b| {
        let engine = RateLimitEngine::builder().build();
        let caller = Identity::anonymous("192.0.2.99");
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            let caller = caller.clone();
            async move {
                black_box(engine.evaluate(&caller, EndpointClass::Upload).await);
            }
        })
    });

    // Many concurrent principals on the in-process store.
    group.bench_function("concurrent_64", |b| {
        let engine = RateLimitEngine::builder()
            .store_timeout(Duration::from_millis(250))
            .fail_open(FailOpenMode::LocalFallback)
            .build();
        b.to_async(&rt).iter(|| {
            let engine = engine.clone();
            async move {
                let calls = (0..64).map(|i| {
                    let engine = engine.clone();
                    async move {
                        let caller = Identity::anonymous(&format!("198.51.100.{}", i));
                        engine.evaluate(&caller, EndpointClass::Api).await
                    }
                });
                black_box(futures::future::join_all(calls).await);
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_evaluate);
criterion_main!(benches);
