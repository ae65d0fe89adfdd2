//! Benchmarks for the gateway hot path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_meshplane::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use rust_meshplane::load_balancer::{string_hash, LoadBalancer, LoadBalancerStrategy};
use rust_meshplane::ratelimit::{RateLimitConfig, RateLimiter};
use rust_meshplane::registry::ServiceInstance;
use rust_meshplane::retry::{RetryConfig, RetryPolicy};
use rust_meshplane::router::{PathMatch, Route, RouteTarget, Router};
use std::time::Duration;

fn bench_circuit_breaker(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new("bench", CircuitBreakerConfig::default());
    let breaker = &breaker;

    c.bench_function("circuit_breaker_execute_success", |b| {
        b.to_async(&rt).iter(|| async move {
            black_box(
                breaker
                    .execute(|| async { Ok::<_, std::io::Error>(1u32) })
                    .await
                    .is_ok(),
            )
        });
    });

    c.bench_function("circuit_breaker_execute_with_timeout", |b| {
        b.to_async(&rt).iter(|| async move {
            black_box(
                breaker
                    .execute_with_timeout(Duration::from_secs(1), || async {
                        Ok::<_, std::io::Error>(1u32)
                    })
                    .await
                    .is_ok(),
            )
        });
    });
}

fn bench_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    let limiter = RateLimiter::new(RateLimitConfig::new(1_000_000, Duration::from_secs(60)));

    group.bench_function("check_single_key", |b| {
        b.iter(|| black_box(limiter.check_key("192.168.1.1").allowed));
    });

    let keys: Vec<String> = (0..256).map(|i| format!("10.0.{}.{}", i / 16, i % 16)).collect();
    group.bench_function("check_rotating_keys", |b| {
        let mut i = 0usize;
        b.iter(|| {
            i = (i + 1) % keys.len();
            black_box(limiter.check_key(&keys[i]).allowed)
        });
    });

    group.finish();
}

fn instances(n: usize) -> Vec<ServiceInstance> {
    (0..n)
        .map(|i| {
            let mut instance = ServiceInstance::new(
                format!("orders-{}", i),
                "orders",
                "10.0.0.1",
                9000 + i as u16,
                Vec::new(),
            );
            instance
                .meta
                .insert("connections".to_string(), (i % 7).to_string());
            instance
        })
        .collect()
}

fn bench_load_balancer(c: &mut Criterion) {
    let mut group = c.benchmark_group("load_balancer");
    let balancer = LoadBalancer::new();
    let pool = instances(16);

    for strategy in [
        LoadBalancerStrategy::RoundRobin,
        LoadBalancerStrategy::Random,
        LoadBalancerStrategy::LeastConnections,
        LoadBalancerStrategy::ConsistentHash,
    ] {
        group.bench_with_input(
            BenchmarkId::new("select", strategy.as_str()),
            &strategy,
            |b, &strategy| {
                b.iter(|| {
                    black_box(balancer.select(&pool, "orders", strategy, Some("user-4711")))
                });
            },
        );
    }

    group.bench_function("string_hash", |b| {
        b.iter(|| black_box(string_hash(black_box("orders-7:9007"))));
    });

    group.finish();
}

fn bench_router(c: &mut Criterion) {
    let mut group = c.benchmark_group("router");

    let mut router = Router::new();
    router.add_route(Route::new(
        "users",
        PathMatch::exact("/api/users"),
        RouteTarget::service("users"),
    ));
    router.add_route(Route::new(
        "api",
        PathMatch::prefix("/api/"),
        RouteTarget::service("api"),
    ));
    router.add_route(Route::new(
        "docs",
        PathMatch::prefix("/docs/"),
        RouteTarget::fixed("http://127.0.0.1:9999"),
    ));
    router.add_route(Route::new(
        "versioned",
        PathMatch::regex(r"^/v[0-9]+/.*"),
        RouteTarget::service("versioned"),
    ));

    let headers = http::HeaderMap::new();

    group.bench_function("route_exact_match", |b| {
        b.iter(|| black_box(router.route(&http::Method::GET, "/api/users", &headers)));
    });

    group.bench_function("route_prefix_match", |b| {
        b.iter(|| black_box(router.route(&http::Method::GET, "/api/products/123", &headers)));
    });

    group.bench_function("route_regex_match", |b| {
        b.iter(|| black_box(router.route(&http::Method::GET, "/v2/resource/abc", &headers)));
    });

    group.bench_function("route_no_match", |b| {
        b.iter(|| black_box(router.route(&http::Method::GET, "/unknown/path", &headers)));
    });

    group.finish();
}

fn bench_retry_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry");

    group.bench_function("calculate_delay", |b| {
        let policy = RetryPolicy::new(RetryConfig::new().with_max_retries(5).with_jitter(false));
        b.iter(|| black_box(policy.next_delay()));
    });

    group.bench_function("calculate_delay_with_jitter", |b| {
        let policy = RetryPolicy::new(RetryConfig::new().with_max_retries(5).with_jitter(true));
        b.iter(|| black_box(policy.next_delay()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_circuit_breaker,
    bench_rate_limiter,
    bench_load_balancer,
    bench_router,
    bench_retry_policy
);
criterion_main!(benches);
