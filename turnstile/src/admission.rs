//! Admission facade
//!
//! The order of checks for one request:
//!
//! 1. store circuit open: reject with `DependencyUnavailable`, touching no limiter
//! 2. resolve the client address and user
//! 3. sliding window per identifier (address, then user)
//! 4. metered endpoints: the global quota per identifier
//! 5. the endpoint's progressive limiter, if it has one
//! 6. the handler
//!
//! Any denial stops the sequence, so a request rejected at step 3 is not
//! counted against the global quota.

use crate::circuit_breaker::{CircuitBreaker, CircuitState};
use crate::error::AdmissionError;
use crate::identity::{ClientIdentity, IdentifierKind, TrustedProxies};
use crate::progressive::{ProgressiveConfig, ProgressiveLimiter};
use crate::rate_limiter::{
    Criticality, DecisionSource, RateLimitConfig, RateLimitDecision, SlidingWindowLimiter,
};
use crate::settings::{AdmissionSettings, LimitSpec};
use crate::store::SharedStore;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

const GLOBAL_SCOPE: &str = "global";

/// How one endpoint is admitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPolicy {
    pub name: String,
    pub criticality: Criticality,
    /// Calls the metered model API and counts against the global quota
    pub metered: bool,
    /// Mutating requests go through the deduplicator
    pub dedupe: bool,
    /// Per-endpoint address and user limit instead of the deployment default
    pub rate_limit: Option<LimitSpec>,
    pub progressive: Option<ProgressiveConfig>,
}

impl EndpointPolicy {
    pub fn new(name: impl Into<String>, criticality: Criticality) -> Self {
        Self {
            name: name.into(),
            criticality,
            metered: false,
            dedupe: false,
            rate_limit: None,
            progressive: None,
        }
    }

    pub fn metered(mut self) -> Self {
        self.metered = true;
        self
    }

    pub fn deduplicated(mut self) -> Self {
        self.dedupe = true;
        self
    }

    pub fn with_rate_limit(mut self, limit: LimitSpec) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_progressive(mut self, config: ProgressiveConfig) -> Self {
        self.progressive = Some(config);
        self
    }
}

/// What the facade needs to know about an inbound request
#[derive(Debug, Clone, Copy)]
pub struct AdmissionRequest<'a> {
    pub peer: IpAddr,
    /// Raw `x-forwarded-for` header
    pub forwarded_for: Option<&'a str>,
    /// User id from the session, when there is one
    pub user_id: Option<&'a str>,
}

/// A request that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub identity: ClientIdentity,
    /// The sliding-window decision with the fewest requests left, if limits ran
    pub tightest: Option<RateLimitDecision>,
}

impl Admitted {
    /// Whether any limit was decided from the instance-local fallback
    pub fn degraded(&self) -> bool {
        self.tightest
            .as_ref()
            .is_some_and(|d| d.source == DecisionSource::LocalFallback)
    }
}

pub struct AdmissionGate {
    store_breaker: Arc<CircuitBreaker>,
    limiter: SlidingWindowLimiter,
    progressive: ProgressiveLimiter,
    proxies: TrustedProxies,
    settings: AdmissionSettings,
}

impl AdmissionGate {
    /// `instances` is the fleet size the local fallback divides limits by
    pub fn new(
        store: Arc<dyn SharedStore>,
        store_breaker: Arc<CircuitBreaker>,
        settings: AdmissionSettings,
        proxies: TrustedProxies,
        instances: u32,
    ) -> Self {
        Self {
            limiter: SlidingWindowLimiter::new(store.clone(), store_breaker.clone(), instances),
            progressive: ProgressiveLimiter::new(store, store_breaker.clone()),
            store_breaker,
            proxies,
            settings,
        }
    }

    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    pub fn store_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.store_breaker
    }

    pub fn limiter(&self) -> &SlidingWindowLimiter {
        &self.limiter
    }

    pub fn progressive(&self) -> &ProgressiveLimiter {
        &self.progressive
    }

    pub fn identify(&self, request: &AdmissionRequest<'_>) -> ClientIdentity {
        ClientIdentity {
            ip: self.proxies.resolve_client_ip(request.peer, request.forwarded_for),
            user_id: request.user_id.map(str::to_string),
        }
    }

    /// Run every admission check for `request` against `policy`
    pub async fn admit(
        &self,
        request: &AdmissionRequest<'_>,
        policy: &EndpointPolicy,
    ) -> Result<Admitted, AdmissionError> {
        self.admit_at(request, policy, SystemTime::now()).await
    }

    /// Like [`admit`](Self::admit) with an explicit clock reading for the sliding windows
    pub async fn admit_at(
        &self,
        request: &AdmissionRequest<'_>,
        policy: &EndpointPolicy,
        now: SystemTime,
    ) -> Result<Admitted, AdmissionError> {
        if self.store_breaker.state() == CircuitState::Open {
            tracing::debug!(endpoint = %policy.name, "store circuit open, rejecting");
            return Err(AdmissionError::unavailable("store"));
        }

        let identity = self.identify(request);
        if !self.settings.rate_limiting_enabled() {
            return Ok(Admitted {
                identity,
                tightest: None,
            });
        }

        let identifiers = identity.identifiers();
        let mut tightest: Option<RateLimitDecision> = None;

        for (kind, id) in &identifiers {
            let config = self.identifier_limit(*kind, policy);
            let decision = self.limiter.check_at(id, &config, now).await?;
            self.deny_if_limited(&decision, &config, policy, id)?;
            keep_tightest(&mut tightest, decision);
        }

        if policy.metered {
            let config = self
                .settings
                .global_limit
                .config(GLOBAL_SCOPE, policy.criticality);
            for (kind, id) in &identifiers {
                let qualified = qualified_id(*kind, id);
                let decision = self.limiter.check_at(&qualified, &config, now).await?;
                self.deny_if_limited(&decision, &config, policy, &qualified)?;
                keep_tightest(&mut tightest, decision);
            }
        }

        if let Some(progressive) = &policy.progressive {
            for (kind, id) in &identifiers {
                self.progressive
                    .check(&qualified_id(*kind, id), progressive)
                    .await?;
            }
        }

        tracing::debug!(
            endpoint = %policy.name,
            ip = %identity.ip,
            user = identity.user_id.as_deref().unwrap_or("-"),
            remaining = tightest.as_ref().map(|d| d.remaining),
            "request admitted"
        );
        Ok(Admitted { identity, tightest })
    }

    /// Admit `request`, then run `handler` with the admission outcome
    ///
    /// The handler is never invoked for a rejected request.
    pub async fn guard<F, Fut, T, E>(
        &self,
        request: &AdmissionRequest<'_>,
        policy: &EndpointPolicy,
        handler: F,
    ) -> Result<T, E>
    where
        F: FnOnce(Admitted) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let admitted = self.admit(request, policy).await?;
        handler(admitted).await
    }

    fn identifier_limit(&self, kind: IdentifierKind, policy: &EndpointPolicy) -> RateLimitConfig {
        match (policy.rate_limit, kind) {
            (Some(limit), kind) => {
                limit.config(format!("{}:{}", kind.as_str(), policy.name), policy.criticality)
            }
            (None, IdentifierKind::Ip) => self.settings.ip_limit.config("ip", policy.criticality),
            (None, IdentifierKind::User) => {
                self.settings.user_limit.config("user", policy.criticality)
            }
        }
    }

    fn deny_if_limited(
        &self,
        decision: &RateLimitDecision,
        config: &RateLimitConfig,
        policy: &EndpointPolicy,
        identifier: &str,
    ) -> Result<(), AdmissionError> {
        if decision.allowed {
            return Ok(());
        }
        tracing::debug!(
            endpoint = %policy.name,
            scope = %config.scope,
            identifier = %identifier,
            retry_after_ms = decision.retry_after.as_millis() as u64,
            "rate limit exceeded"
        );
        Err(decision.to_error(&config.scope))
    }
}

fn qualified_id(kind: IdentifierKind, id: &str) -> String {
    format!("{}:{}", kind.as_str(), id)
}

fn keep_tightest(tightest: &mut Option<RateLimitDecision>, decision: RateLimitDecision) {
    if tightest
        .as_ref()
        .is_none_or(|current| decision.remaining < current.remaining)
    {
        *tightest = Some(decision);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn gate(settings: AdmissionSettings) -> AdmissionGate {
        let breaker = Arc::new(CircuitBreaker::new("store", CircuitBreakerConfig::default()));
        AdmissionGate::new(
            Arc::new(MemoryStore::new()),
            breaker,
            settings,
            TrustedProxies::default(),
            1,
        )
    }

    fn request(user: Option<&str>) -> AdmissionRequest<'_> {
        AdmissionRequest {
            peer: "1.2.3.4".parse().unwrap(),
            forwarded_for: None,
            user_id: user,
        }
    }

    #[tokio::test]
    async fn test_tightest_decision_is_reported() {
        let gate = gate(AdmissionSettings {
            ip_limit: LimitSpec::per_minute(10),
            user_limit: LimitSpec::per_minute(3),
            ..AdmissionSettings::default()
        });
        let policy = EndpointPolicy::new("chat", Criticality::Standard);

        let admitted = gate.admit(&request(Some("u1")), &policy).await.unwrap();
        assert!(!admitted.degraded());
        let tightest = admitted.tightest.unwrap();
        assert_eq!(tightest.limit, 3);
        assert_eq!(tightest.remaining, 2);
    }

    #[tokio::test]
    async fn test_endpoint_override_uses_its_own_scope() {
        let gate = gate(AdmissionSettings {
            ip_limit: LimitSpec::per_minute(100),
            ..AdmissionSettings::default()
        });
        let strict = EndpointPolicy::new("export", Criticality::Standard)
            .with_rate_limit(LimitSpec::per_minute(1));
        let relaxed = EndpointPolicy::new("chat", Criticality::Standard);

        gate.admit(&request(None), &strict).await.unwrap();
        let err = gate.admit(&request(None), &strict).await.unwrap_err();
        assert!(matches!(err, AdmissionError::RateLimited { ref scope, .. } if scope == "ip:export"));

        gate.admit(&request(None), &relaxed).await.unwrap();
    }

    #[tokio::test]
    async fn test_guard_skips_handler_on_denial() {
        let gate = gate(AdmissionSettings {
            ip_limit: LimitSpec::new(1, Duration::from_secs(60)),
            ..AdmissionSettings::default()
        });
        let policy = EndpointPolicy::new("chat", Criticality::Standard);
        let mut calls = 0;

        for _ in 0..2 {
            let _ = gate
                .guard(&request(None), &policy, |_| {
                    calls += 1;
                    async { Ok::<_, AdmissionError>(()) }
                })
                .await;
        }
        assert_eq!(calls, 1);
    }
}
