use super::*;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
use crate::store::{FaultInjectingStore, KeyTtl, MemoryStore};

fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn store_breaker() -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        "store",
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
        },
    ))
}

fn standard(max_requests: u32) -> RateLimitConfig {
    RateLimitConfig::new("ip", max_requests, Duration::from_secs(60), Criticality::Standard)
}

#[tokio::test]
async fn test_allows_up_to_limit_then_denies() {
    let limiter = SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), store_breaker(), 1);
    let cfg = standard(5);

    let mut last_remaining = u32::MAX;
    for i in 0..5 {
        let now = t0() + Duration::from_millis(i * 100);
        let d = limiter.check_at("1.2.3.4", &cfg, now).await.unwrap();
        assert!(d.allowed, "request {i} should be allowed");
        assert!(d.remaining < last_remaining);
        assert_eq!(d.limit, 5);
        assert_eq!(d.source, DecisionSource::Distributed);
        last_remaining = d.remaining;
    }
    assert_eq!(last_remaining, 0);

    let now = t0() + Duration::from_secs(1);
    let denied = limiter.check_at("1.2.3.4", &cfg, now).await.unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert_eq!(denied.reset_at, now + cfg.window);
}

#[tokio::test]
async fn test_allowed_again_after_window_elapses() {
    let limiter = SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), store_breaker(), 1);
    let cfg = standard(3);

    for _ in 0..3 {
        assert!(limiter.check_at("u1", &cfg, t0()).await.unwrap().allowed);
    }
    assert!(!limiter.check_at("u1", &cfg, t0()).await.unwrap().allowed);

    let later = t0() + cfg.window + Duration::from_millis(1);
    let d = limiter.check_at("u1", &cfg, later).await.unwrap();
    assert!(d.allowed);
    assert_eq!(d.remaining, 2);
}

#[tokio::test]
async fn test_window_slides_one_entry_at_a_time() {
    let limiter = SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), store_breaker(), 1);
    let cfg = standard(3);

    for secs in [0, 10, 20] {
        let d = limiter
            .check_at("k", &cfg, t0() + Duration::from_secs(secs))
            .await
            .unwrap();
        assert!(d.allowed);
    }

    let denied = limiter
        .check_at("k", &cfg, t0() + Duration::from_secs(30))
        .await
        .unwrap();
    assert!(!denied.allowed);
    // The oldest entry (t0) leaves the window just after t0 + 60s
    assert_eq!(denied.retry_after, Duration::from_millis(30_001));
    assert_eq!(denied.to_error("ip").retry_after_secs(), Some(31));

    // Only the first slot has freed up
    let at = t0() + Duration::from_secs(61);
    assert!(limiter.check_at("k", &cfg, at).await.unwrap().allowed);
    assert!(!limiter.check_at("k", &cfg, at).await.unwrap().allowed);
}

#[tokio::test]
async fn test_scopes_and_identifiers_are_isolated() {
    let limiter = SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), store_breaker(), 1);
    let ip = standard(1);
    let user = RateLimitConfig::new("user", 1, Duration::from_secs(60), Criticality::Standard);

    assert!(limiter.check_at("a", &ip, t0()).await.unwrap().allowed);
    assert!(!limiter.check_at("a", &ip, t0()).await.unwrap().allowed);
    assert!(limiter.check_at("b", &ip, t0()).await.unwrap().allowed);
    assert!(limiter.check_at("a", &user, t0()).await.unwrap().allowed);
}

#[tokio::test(start_paused = true)]
async fn test_window_key_carries_expiry() {
    let store = Arc::new(MemoryStore::new());
    let limiter = SlidingWindowLimiter::new(store.clone(), store_breaker(), 1);
    let cfg = standard(10);

    limiter.check_at("k", &cfg, t0()).await.unwrap();
    assert_eq!(
        store.ttl(&cfg.key("k")).await.unwrap(),
        KeyTtl::Expires(cfg.window)
    );
}

#[tokio::test]
async fn test_rejects_invalid_config() {
    let limiter = SlidingWindowLimiter::new(Arc::new(MemoryStore::new()), store_breaker(), 1);

    let zero_limit = standard(0);
    assert!(matches!(
        limiter.check_at("k", &zero_limit, t0()).await,
        Err(AdmissionError::InvalidConfig(_))
    ));

    let zero_window = RateLimitConfig::new("ip", 10, Duration::ZERO, Criticality::Standard);
    assert!(matches!(
        limiter.check_at("k", &zero_window, t0()).await,
        Err(AdmissionError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_store_outage_standard_uses_instance_adjusted_fallback() {
    let store = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
    let limiter = SlidingWindowLimiter::new(store.clone(), store_breaker(), 4);
    let cfg = standard(100);
    store.set_failing(true);

    let d = limiter.check_at("1.2.3.4", &cfg, t0()).await.unwrap();
    assert!(d.allowed);
    assert_eq!(d.source, DecisionSource::LocalFallback);
    assert_eq!(d.limit, 25);
    assert_eq!(d.remaining, 24);
}

#[tokio::test]
async fn test_store_outage_security_critical_fails_closed() {
    let store = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
    let limiter = SlidingWindowLimiter::new(store.clone(), store_breaker(), 4);
    let login = RateLimitConfig::new(
        "login",
        5,
        Duration::from_secs(60),
        Criticality::SecurityCritical,
    );
    store.set_failing(true);

    let err = limiter.check_at("1.2.3.4", &login, t0()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::DependencyUnavailable { .. }));
    assert_eq!(err.status_code(), 503);
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_skips_store_entirely() {
    let store = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
    let breaker = store_breaker();
    let limiter = SlidingWindowLimiter::new(store.clone(), breaker.clone(), 1);
    let cfg = standard(10);
    store.set_failing(true);

    for _ in 0..3 {
        limiter.check_at("k", &cfg, t0()).await.unwrap();
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let calls = store.calls();
    let d = limiter.check_at("k", &cfg, t0()).await.unwrap();
    assert_eq!(d.source, DecisionSource::LocalFallback);
    assert_eq!(store.calls(), calls);

    // Store recovers; the trial after the cooldown goes back to the store
    store.set_failing(false);
    tokio::time::advance(Duration::from_secs(30)).await;
    let d = limiter.check_at("k", &cfg, t0()).await.unwrap();
    assert_eq!(d.source, DecisionSource::Distributed);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[test]
fn test_criticality_deserializes_from_snake_case() {
    #[derive(serde::Deserialize)]
    struct Policy {
        criticality: Criticality,
    }

    let policy: Policy = serde_json::from_str(r#"{"criticality":"security_critical"}"#).unwrap();
    assert_eq!(policy.criticality, Criticality::SecurityCritical);
    assert!(policy.criticality.fails_closed());

    let missing = serde_json::from_str::<Policy>("{}");
    assert!(missing.is_err());
}
