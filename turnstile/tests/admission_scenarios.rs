//! End-to-end admission scenarios against in-process stores

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use turnstile::{
    AdmissionError, AdmissionGate, AdmissionRequest, AdmissionSettings, CircuitBreaker,
    CircuitBreakerConfig, CircuitState, Criticality, DecisionSource, EndpointPolicy, Environment,
    FaultInjectingStore, LimitSpec, MemoryStore, ProgressiveConfig, SharedStore, TrustedProxies,
};

struct Harness {
    store: Arc<FaultInjectingStore<MemoryStore>>,
    breaker: Arc<CircuitBreaker>,
    gate: AdmissionGate,
}

fn harness(settings: AdmissionSettings, proxies: TrustedProxies, instances: u32) -> Harness {
    let store = Arc::new(FaultInjectingStore::new(MemoryStore::new()));
    let breaker = Arc::new(CircuitBreaker::new(
        "store",
        CircuitBreakerConfig {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout: Duration::from_secs(30),
        },
    ));
    let gate = AdmissionGate::new(store.clone(), breaker.clone(), settings, proxies, instances);
    Harness {
        store,
        breaker,
        gate,
    }
}

fn ten_per_minute() -> AdmissionSettings {
    AdmissionSettings {
        ip_limit: LimitSpec::per_minute(10),
        user_limit: LimitSpec::per_minute(10),
        ..AdmissionSettings::default()
    }
}

fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

fn t0() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(1_700_000_000)
}

fn chat() -> EndpointPolicy {
    EndpointPolicy::new("chat", Criticality::Standard)
}

fn login() -> EndpointPolicy {
    EndpointPolicy::new("login", Criticality::SecurityCritical)
}

#[tokio::test]
async fn test_eleventh_request_from_same_user_and_ip_is_denied() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 1);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: Some("u1"),
    };

    for i in 0..10 {
        let at = t0() + Duration::from_secs(i);
        let admitted = h.gate.admit_at(&request, &chat(), at).await.unwrap();
        assert_eq!(admitted.tightest.unwrap().remaining, 9 - i as u32);
    }

    let err = h
        .gate
        .admit_at(&request, &chat(), t0() + Duration::from_secs(10))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 429);
    assert!(matches!(err, AdmissionError::RateLimited { limit: 10, .. }));
    assert_eq!(err.retry_after_secs(), Some(51));
}

#[tokio::test]
async fn test_user_limit_applies_across_addresses() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 1);

    for i in 0..10 {
        let peer = ip(&format!("10.0.0.{}", i + 1));
        let request = AdmissionRequest {
            peer,
            forwarded_for: None,
            user_id: Some("u1"),
        };
        h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    }

    let fresh_ip = AdmissionRequest {
        peer: ip("10.0.0.99"),
        forwarded_for: None,
        user_id: Some("u1"),
    };
    let err = h.gate.admit_at(&fresh_ip, &chat(), t0()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::RateLimited { ref scope, .. } if scope == "user"));
}

#[tokio::test]
async fn test_denied_identifier_recovers_after_window() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 1);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    for _ in 0..10 {
        h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    }
    assert!(h.gate.admit_at(&request, &chat(), t0()).await.is_err());

    let later = t0() + Duration::from_secs(61);
    let admitted = h.gate.admit_at(&request, &chat(), later).await.unwrap();
    assert_eq!(admitted.tightest.unwrap().remaining, 9);
}

#[tokio::test]
async fn test_spoofed_forwarded_for_is_ignored_without_trusted_proxies() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 1);
    let request = AdmissionRequest {
        peer: ip("9.9.9.9"),
        forwarded_for: Some("attacker-ip, 9.9.9.9"),
        user_id: None,
    };

    let admitted = h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    assert_eq!(admitted.identity.ip, ip("9.9.9.9"));
    assert_eq!(h.store.inner().zcard("ratelimit:ip:9.9.9.9").await.unwrap(), 1);

    // Rotating the header does not buy a fresh budget
    for i in 0..9 {
        let spoofed = format!("6.6.6.{i}");
        let rotated = AdmissionRequest {
            forwarded_for: Some(&spoofed),
            ..request
        };
        h.gate.admit_at(&rotated, &chat(), t0()).await.unwrap();
    }
    assert!(h.gate.admit_at(&request, &chat(), t0()).await.is_err());
}

#[tokio::test]
async fn test_trusted_proxy_chain_resolves_originating_client() {
    let proxies = TrustedProxies::parse_list("10.0.0.0/8").unwrap();
    let h = harness(ten_per_minute(), proxies, 1);
    let request = AdmissionRequest {
        peer: ip("10.0.0.5"),
        forwarded_for: Some("198.51.100.4, 10.20.0.1"),
        user_id: None,
    };

    let admitted = h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    assert_eq!(admitted.identity.ip, ip("198.51.100.4"));
}

#[tokio::test]
async fn test_store_outage_standard_endpoint_admits_with_instance_limit() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 2);
    h.store.set_failing(true);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    let admitted = h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    let decision = admitted.tightest.clone().unwrap();
    assert_eq!(decision.source, DecisionSource::LocalFallback);
    assert_eq!(decision.limit, 5);
    assert!(admitted.degraded());
}

#[tokio::test]
async fn test_store_outage_login_endpoint_is_denied() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 2);
    h.store.set_failing(true);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    let err = h.gate.admit_at(&request, &login(), t0()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::DependencyUnavailable { .. }));
    assert_eq!(err.status_code(), 503);
    assert_eq!(err.retry_after_secs(), Some(30));
}

#[tokio::test(start_paused = true)]
async fn test_open_store_circuit_rejects_before_any_limiter() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 1);
    h.store.set_failing(true);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    // Fallback keeps standard traffic flowing until the circuit opens
    for _ in 0..5 {
        h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    }
    assert_eq!(h.breaker.state(), CircuitState::Open);

    let calls = h.store.calls();
    let fallback_entries = h.gate.limiter().fallback().len();
    let err = h.gate.admit_at(&request, &chat(), t0()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::DependencyUnavailable { .. }));
    assert_eq!(h.store.calls(), calls);
    assert_eq!(h.gate.limiter().fallback().len(), fallback_entries);

    // Recovery: after the cooldown the trial request reaches the store again
    h.store.set_failing(false);
    tokio::time::advance(Duration::from_secs(30)).await;
    let admitted = h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    assert_eq!(admitted.tightest.unwrap().source, DecisionSource::Distributed);
    assert_eq!(h.breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_disable_flag_ignored_in_production() {
    let disabled = |environment| AdmissionSettings {
        environment,
        disable_rate_limiting: true,
        ip_limit: LimitSpec::per_minute(1),
        ..AdmissionSettings::default()
    };
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    let dev = harness(disabled(Environment::Development), TrustedProxies::default(), 1);
    for _ in 0..5 {
        let admitted = dev.gate.admit_at(&request, &chat(), t0()).await.unwrap();
        assert!(admitted.tightest.is_none());
    }

    let prod = harness(disabled(Environment::Production), TrustedProxies::default(), 1);
    prod.gate.admit_at(&request, &chat(), t0()).await.unwrap();
    assert!(prod.gate.admit_at(&request, &chat(), t0()).await.is_err());
}

#[tokio::test]
async fn test_global_quota_checked_for_metered_endpoints_only() {
    let settings = AdmissionSettings {
        global_limit: LimitSpec::new(3, Duration::from_secs(24 * 60 * 60)),
        ..ten_per_minute()
    };
    let h = harness(settings, TrustedProxies::default(), 1);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: Some("u1"),
    };
    let metered = chat().metered();

    for _ in 0..3 {
        h.gate.admit_at(&request, &metered, t0()).await.unwrap();
    }
    let err = h.gate.admit_at(&request, &metered, t0()).await.unwrap_err();
    assert!(matches!(err, AdmissionError::RateLimited { ref scope, .. } if scope == "global"));

    // Unmetered traffic only sees the per-minute limits
    h.gate.admit_at(&request, &chat(), t0()).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_progressive_runs_after_global_quota() {
    let settings = AdmissionSettings {
        global_limit: LimitSpec::new(2, Duration::from_secs(3600)),
        ..ten_per_minute()
    };
    let h = harness(settings, TrustedProxies::default(), 1);
    let mut progressive = ProgressiveConfig::new("generate");
    progressive.max_requests = 100;
    let policy = EndpointPolicy::new("generate", Criticality::Standard)
        .metered()
        .with_progressive(progressive);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    for _ in 0..3 {
        let _ = h.gate.admit_at(&request, &policy, t0()).await;
    }

    // The request denied by the global quota never reached the progressive counter
    let counter = h.store.inner().get("progressive:generate:ip:1.2.3.4").await.unwrap();
    assert_eq!(counter.as_deref(), Some("2"));
}

#[tokio::test(start_paused = true)]
async fn test_login_lockout_through_gate() {
    let h = harness(ten_per_minute(), TrustedProxies::default(), 1);
    let progressive = ProgressiveConfig {
        max_requests: 1,
        lockout_threshold: 2,
        ..ProgressiveConfig::new("login")
    };
    let policy = login().with_progressive(progressive);
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };

    h.gate.admit(&request, &policy).await.unwrap();
    let err = h.gate.admit(&request, &policy).await.unwrap_err();
    assert!(matches!(err, AdmissionError::RateLimited { .. }));
    let err = h.gate.admit(&request, &policy).await.unwrap_err();
    assert!(matches!(err, AdmissionError::Locked { .. }));
    assert_eq!(err.status_code(), 429);

    let locked = h.gate.progressive().list_lockouts("login").await.unwrap();
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].identifier, "ip:1.2.3.4");
}

#[tokio::test]
async fn test_guard_runs_handler_once_per_admitted_request() {
    let h = harness(
        AdmissionSettings {
            ip_limit: LimitSpec::per_minute(2),
            ..AdmissionSettings::default()
        },
        TrustedProxies::default(),
        1,
    );
    let request = AdmissionRequest {
        peer: ip("1.2.3.4"),
        forwarded_for: None,
        user_id: None,
    };
    let runs = AtomicU32::new(0);

    let mut statuses = Vec::new();
    for _ in 0..3 {
        let outcome: Result<u16, AdmissionError> = h
            .gate
            .guard(&request, &chat(), |_| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok(200)
            })
            .await;
        statuses.push(outcome.unwrap_or_else(|e| e.status_code()));
    }

    assert_eq!(statuses, vec![200, 200, 429]);
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}
