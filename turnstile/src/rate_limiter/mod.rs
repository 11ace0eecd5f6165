//! Distributed sliding-window rate limiter
//!
//! Every admitted request is recorded as one member of a sorted set scored by
//! its timestamp in milliseconds. A check prunes members that fell out of the
//! trailing window, counts the rest, and records the request only if the count
//! is still below the limit.
//!
//! When the shared store is unreachable (or its circuit is open) the outcome
//! depends on the limiter's [`Criticality`]:
//!
//! | Criticality        | Store down                                  |
//! |--------------------|---------------------------------------------|
//! | `Standard`         | instance-local [`LocalFallback`] decides     |
//! | `SecurityCritical` | denied with `DependencyUnavailable`          |
//!
//! The prune, count and add steps are separate store commands, so concurrent
//! checks for the same key can briefly admit more than `max_requests`.

mod fallback;

#[cfg(test)]
mod tests;

pub use fallback::LocalFallback;

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::{AdmissionError, StoreError, StoreResult};
use crate::store::SharedStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How a limiter behaves when its shared store cannot be consulted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    /// Fail over to the instance-local table
    Standard,
    /// Fail closed: authentication and other abuse-sensitive paths
    SecurityCritical,
}

impl Criticality {
    pub fn fails_closed(self) -> bool {
        matches!(self, Criticality::SecurityCritical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Criticality::Standard => "standard",
            Criticality::SecurityCritical => "security_critical",
        }
    }
}

/// Limiter parameters for one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Namespace for the counters, e.g. `ip`, `user` or `global`
    pub scope: String,
    /// Requests admitted per window
    pub max_requests: u32,
    /// Length of the trailing window
    pub window: Duration,
    pub criticality: Criticality,
}

impl RateLimitConfig {
    pub fn new(
        scope: impl Into<String>,
        max_requests: u32,
        window: Duration,
        criticality: Criticality,
    ) -> Self {
        Self {
            scope: scope.into(),
            max_requests,
            window,
            criticality,
        }
    }

    /// Reject parameters that could never admit a request
    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.scope.is_empty() {
            return Err(AdmissionError::InvalidConfig(
                "rate limit scope must not be empty".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(AdmissionError::InvalidConfig(format!(
                "max_requests for scope '{}' must be greater than 0",
                self.scope
            )));
        }
        if self.window.as_millis() == 0 {
            return Err(AdmissionError::InvalidConfig(format!(
                "window for scope '{}' must be at least 1ms",
                self.scope
            )));
        }
        Ok(())
    }

    /// Store key for `identifier` under this scope
    pub fn key(&self, identifier: &str) -> String {
        format!("ratelimit:{}:{}", self.scope, identifier)
    }
}

/// Where a decision was made
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Distributed,
    LocalFallback,
}

/// Outcome of a rate limit check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Limit that was applied (the per-instance share on the fallback path)
    pub limit: u32,
    /// Requests left in the current window after this one
    pub remaining: u32,
    /// When a full window will have passed since this check
    pub reset_at: SystemTime,
    /// Delay before a request for this key can succeed, zero when allowed
    pub retry_after: Duration,
    pub source: DecisionSource,
}

impl RateLimitDecision {
    /// The denial error for this decision under `scope`
    pub fn to_error(&self, scope: &str) -> AdmissionError {
        AdmissionError::rate_limited(scope, self.limit, self.retry_after)
    }

    /// `Ok(self)` when allowed, the scope's `RateLimited` error otherwise
    pub fn into_result(self, scope: &str) -> Result<Self, AdmissionError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(self.to_error(scope))
        }
    }
}

/// Sliding-window limiter over a [`SharedStore`], guarded by the store breaker
pub struct SlidingWindowLimiter {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
    fallback: LocalFallback,
}

impl SlidingWindowLimiter {
    /// `instances` is the fleet size the fallback divides limits by
    pub fn new(store: Arc<dyn SharedStore>, breaker: Arc<CircuitBreaker>, instances: u32) -> Self {
        Self::with_fallback(store, breaker, LocalFallback::new(instances))
    }

    pub fn with_fallback(
        store: Arc<dyn SharedStore>,
        breaker: Arc<CircuitBreaker>,
        fallback: LocalFallback,
    ) -> Self {
        Self {
            store,
            breaker,
            fallback,
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn fallback(&self) -> &LocalFallback {
        &self.fallback
    }

    /// Check and record one request for `identifier`
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::InvalidConfig`] for a zero limit or window
    /// - [`AdmissionError::DependencyUnavailable`] when the store is down and
    ///   the config is [`Criticality::SecurityCritical`]
    ///
    /// A denial is not an error: inspect [`RateLimitDecision::allowed`].
    pub async fn check(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
    ) -> Result<RateLimitDecision, AdmissionError> {
        self.check_at(identifier, config, SystemTime::now()).await
    }

    /// Like [`check`](Self::check) with an explicit clock reading
    pub async fn check_at(
        &self,
        identifier: &str,
        config: &RateLimitConfig,
        now: SystemTime,
    ) -> Result<RateLimitDecision, AdmissionError> {
        config.validate()?;
        let key = config.key(identifier);

        let result = self
            .breaker
            .execute(|| self.distributed_check(&key, config, now))
            .await;

        match result {
            Ok(decision) => {
                tracing::debug!(
                    key = %key,
                    allowed = decision.allowed,
                    remaining = decision.remaining,
                    "rate limit decision"
                );
                Ok(decision)
            }
            Err(err) => self.on_store_failure(&key, config, now, err),
        }
    }

    fn on_store_failure(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: SystemTime,
        err: CircuitError<StoreError>,
    ) -> Result<RateLimitDecision, AdmissionError> {
        if config.criticality.fails_closed() {
            tracing::warn!(
                scope = %config.scope,
                error = %err,
                "store unavailable for security-critical limiter, denying"
            );
            return Err(AdmissionError::unavailable("store"));
        }

        let decision = self.fallback.check(key, config, now);
        tracing::warn!(
            scope = %config.scope,
            error = %err,
            allowed = decision.allowed,
            limit = decision.limit,
            "store unavailable, using local rate limit fallback"
        );
        Ok(decision)
    }

    async fn distributed_check(
        &self,
        key: &str,
        config: &RateLimitConfig,
        now: SystemTime,
    ) -> StoreResult<RateLimitDecision> {
        let now_ms = epoch_millis(now);
        let window_ms = i64::try_from(config.window.as_millis()).unwrap_or(i64::MAX);
        let window_start = now_ms.saturating_sub(window_ms);
        let reset_at = now + config.window;

        self.store
            .zrem_range_by_score(key, i64::MIN, window_start - 1)
            .await?;
        let count = self.store.zcard(key).await?;

        if count >= u64::from(config.max_requests) {
            let oldest = self
                .store
                .zrange_by_score(key, window_start, i64::MAX, 1)
                .await?;
            let retry_after = oldest
                .first()
                .map(|(_, score)| {
                    let frees_at = score.saturating_add(window_ms).saturating_add(1);
                    Duration::from_millis(frees_at.saturating_sub(now_ms).max(0) as u64)
                })
                .unwrap_or(config.window);

            return Ok(RateLimitDecision {
                allowed: false,
                limit: config.max_requests,
                remaining: 0,
                reset_at,
                retry_after,
                source: DecisionSource::Distributed,
            });
        }

        let member = format!("{now_ms}-{:016x}", rand::random::<u64>());
        self.store.zadd(key, now_ms, &member).await?;
        self.store.expire(key, config.window).await?;

        // count < max_requests, so this fits in u32 and does not underflow
        let remaining = config.max_requests - count as u32 - 1;
        Ok(RateLimitDecision {
            allowed: true,
            limit: config.max_requests,
            remaining,
            reset_at,
            retry_after: Duration::ZERO,
            source: DecisionSource::Distributed,
        })
    }
}

/// Milliseconds since the Unix epoch, clamped to zero for pre-epoch clocks
pub(crate) fn epoch_millis(at: SystemTime) -> i64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
