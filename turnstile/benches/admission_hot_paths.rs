use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Runtime;
use turnstile::{
    AdmissionGate, AdmissionRequest, AdmissionSettings, CircuitBreaker, CircuitBreakerConfig,
    Criticality, DedupConfig, DedupRequest, Deduplicator, EndpointPolicy, LimitSpec,
    LocalFallback, MemoryStore, RateLimitConfig, SlidingWindowLimiter, TrustedProxies,
};

fn breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new("store", CircuitBreakerConfig::default()))
}

fn benchmark_local_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("local_paths");
    group.throughput(Throughput::Elements(1));

    group.bench_function("fallback_rotating_keys_1000", |b| {
        let fallback = LocalFallback::new(4);
        let config = RateLimitConfig::new("ip", 1_000, Duration::from_secs(60), Criticality::Standard);
        let mut counter = 0u64;

        b.iter(|| {
            let key = format!("ratelimit:ip:10.0.{}.{}", (counter / 256) % 4, counter % 256);
            counter += 1;
            black_box(fallback.check(black_box(&key), &config, SystemTime::now()).allowed)
        });
    });

    group.bench_function("resolve_client_ip_three_hops", |b| {
        let proxies = TrustedProxies::parse_list("10.0.0.0/8, 172.16.0.0/12").unwrap();
        let peer = "10.0.0.1".parse().unwrap();

        b.iter(|| {
            black_box(proxies.resolve_client_ip(
                black_box(peer),
                black_box(Some("6.6.6.6, 203.0.113.7, 172.16.4.4, 10.2.3.4")),
            ))
        });
    });

    group.bench_function("dedup_content_digest_1kb", |b| {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()), breaker(), DedupConfig::default());
        let headers = vec![("authorization".to_string(), b"Bearer abcdef".to_vec())];
        let body = vec![b'x'; 1024];
        let request = DedupRequest {
            method: "POST",
            path: "/api/chat",
            requester: Some("user:u1"),
            headers: &headers,
            body: Some(&body),
        };

        b.iter(|| black_box(dedup.derive_key(black_box(&request), SystemTime::now()).unwrap()));
    });

    group.finish();
}

fn benchmark_async_paths(c: &mut Criterion) {
    let runtime = Runtime::new().unwrap();
    let mut group = c.benchmark_group("async_paths");
    group.throughput(Throughput::Elements(1));

    group.bench_function("breaker_execute_closed", |b| {
        let breaker = breaker();
        b.to_async(&runtime).iter(|| {
            let breaker = breaker.clone();
            async move {
                black_box(
                    breaker
                        .execute(|| async { Ok::<_, ()>(1u32) })
                        .await
                        .is_ok(),
                )
            }
        });
    });

    group.bench_function("sliding_window_memory_store", |b| {
        let limiter = Arc::new(SlidingWindowLimiter::new(
            Arc::new(MemoryStore::new()),
            breaker(),
            1,
        ));
        let config = RateLimitConfig::new("ip", 100, Duration::from_secs(1), Criticality::Standard);
        let mut counter = 0u64;

        b.to_async(&runtime).iter(|| {
            let limiter = limiter.clone();
            let config = config.clone();
            let key = format!("client_{}", counter % 1_000);
            counter += 1;
            async move { black_box(limiter.check(&key, &config).await.unwrap().allowed) }
        });
    });

    group.bench_function("gate_admit_anonymous", |b| {
        let gate = Arc::new(AdmissionGate::new(
            Arc::new(MemoryStore::new()),
            breaker(),
            AdmissionSettings {
                ip_limit: LimitSpec::new(1_000_000, Duration::from_secs(1)),
                ..AdmissionSettings::default()
            },
            TrustedProxies::default(),
            1,
        ));
        let policy = Arc::new(EndpointPolicy::new("chat", Criticality::Standard));
        let mut counter = 0u32;

        b.to_async(&runtime).iter(|| {
            let gate = gate.clone();
            let policy = policy.clone();
            let peer = std::net::Ipv4Addr::from(0x0a00_0000 | (counter % 4096)).into();
            counter += 1;
            async move {
                let request = AdmissionRequest {
                    peer,
                    forwarded_for: None,
                    user_id: None,
                };
                black_box(gate.admit(&request, &policy).await.is_ok())
            }
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_local_paths, benchmark_async_paths);
criterion_main!(benches);
