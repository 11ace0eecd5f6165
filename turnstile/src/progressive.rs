//! Progressive penalties for abuse-prone endpoints
//!
//! On top of a fixed-window counter, every request over the limit counts as a
//! violation. Violations first earn an exponentially growing delay
//! (1s, 2s, 4s, ... capped at 30s) and, at `lockout_threshold`, a lockout that
//! rejects the identifier outright for `lockout_duration`.
//!
//! Store keys, per endpoint and identifier:
//!
//! - `progressive:<endpoint>:<id>`: fixed-window request counter
//! - `violations:<endpoint>:<id>`: violation counter, expires after an hour
//! - `lockout:<endpoint>:<id>`: present while locked out
//! - `lockouts:<endpoint>`: set of identifiers that have been locked out
//!
//! Every store call runs under the store circuit breaker. A failed or rejected
//! call lets the request through.

use crate::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::error::{AdmissionError, StoreError, TransactionError, ceil_secs};
use crate::store::{KeyTtl, SharedStore};
use crate::transaction::with_transaction;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(30);
const VIOLATION_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressiveConfig {
    /// Endpoint name used in store keys and errors
    pub endpoint: String,
    pub max_requests: u32,
    pub window: Duration,
    /// Violations that trigger a lockout
    pub lockout_threshold: u32,
    pub lockout_duration: Duration,
    pub enable_progressive_delay: bool,
    pub enable_account_lockout: bool,
}

impl ProgressiveConfig {
    /// Login-style defaults: 5 attempts per 15 minutes, 15 minute lockout after 5 violations
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_requests: 5,
            window: Duration::from_secs(15 * 60),
            lockout_threshold: 5,
            lockout_duration: Duration::from_secs(15 * 60),
            enable_progressive_delay: true,
            enable_account_lockout: true,
        }
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        if self.endpoint.is_empty() {
            return Err(AdmissionError::InvalidConfig(
                "progressive endpoint name must not be empty".to_string(),
            ));
        }
        if self.max_requests == 0 || self.window.as_millis() == 0 {
            return Err(AdmissionError::InvalidConfig(format!(
                "progressive limit for '{}' needs max_requests and window above zero",
                self.endpoint
            )));
        }
        if self.enable_account_lockout
            && (self.lockout_threshold == 0 || self.lockout_duration.as_millis() == 0)
        {
            return Err(AdmissionError::InvalidConfig(format!(
                "lockout for '{}' needs a threshold and duration above zero",
                self.endpoint
            )));
        }
        Ok(())
    }

    fn counter_key(&self, identifier: &str) -> String {
        format!("progressive:{}:{}", self.endpoint, identifier)
    }

    fn violations_key(&self, identifier: &str) -> String {
        violations_key(&self.endpoint, identifier)
    }

    fn lockout_key(&self, identifier: &str) -> String {
        lockout_key(&self.endpoint, identifier)
    }
}

fn lockout_key(endpoint: &str, identifier: &str) -> String {
    format!("lockout:{endpoint}:{identifier}")
}

fn lockout_index_key(endpoint: &str) -> String {
    format!("lockouts:{endpoint}")
}

fn violations_key(endpoint: &str, identifier: &str) -> String {
    format!("violations:{endpoint}:{identifier}")
}

/// Delay before the denial for the given violation count
pub fn progressive_delay(violations: u64) -> Duration {
    let exponent = violations.saturating_sub(1).min(31) as u32;
    BASE_DELAY
        .checked_mul(1u32 << exponent)
        .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
}

/// A locked-out identifier, as listed for operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockoutEntry {
    pub identifier: String,
    pub retry_after_secs: u64,
}

pub struct ProgressiveLimiter {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
}

impl ProgressiveLimiter {
    pub fn new(store: Arc<dyn SharedStore>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    /// Admit or penalize one request from `identifier`
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::Locked`] while a lockout is active or when this
    ///   request triggers one
    /// - [`AdmissionError::RateLimited`] when over the limit (after the delay)
    /// - [`AdmissionError::InvalidConfig`] for unusable parameters
    pub async fn check(&self, identifier: &str, config: &ProgressiveConfig) -> Result<(), AdmissionError> {
        config.validate()?;

        let lockout_key = config.lockout_key(identifier);
        match self.guarded(|| self.store.ttl(&lockout_key)).await {
            Some(KeyTtl::Missing) => {}
            Some(ttl) => {
                let remaining = ttl.as_expiry().unwrap_or(config.lockout_duration);
                return Err(AdmissionError::Locked {
                    endpoint: config.endpoint.clone(),
                    retry_after_secs: ceil_secs(remaining),
                });
            }
            None => return Ok(()),
        }

        let counter_key = config.counter_key(identifier);
        let Some(count) = self
            .guarded(|| self.store.incr_with_expiry(&counter_key, config.window))
            .await
        else {
            return Ok(());
        };

        let violations_key = config.violations_key(identifier);
        if count <= i64::from(config.max_requests) {
            // Only the first request of a window can follow a violation
            if count == 1 {
                self.guarded(|| self.store.delete(&violations_key)).await;
            }
            return Ok(());
        }

        let Some(violations) = self
            .guarded(|| self.store.incr_with_expiry(&violations_key, VIOLATION_TTL))
            .await
        else {
            return Ok(());
        };
        let violations = violations.max(1) as u64;

        if config.enable_account_lockout && violations >= u64::from(config.lockout_threshold) {
            return Err(self.lock_out(identifier, config, violations).await);
        }

        if config.enable_progressive_delay {
            let delay = progressive_delay(violations);
            tracing::debug!(
                endpoint = %config.endpoint,
                identifier = %identifier,
                violations,
                delay_ms = delay.as_millis() as u64,
                "delaying rate-limited request"
            );
            tokio::time::sleep(delay).await;
        }

        let retry_after = match self.guarded(|| self.store.ttl(&counter_key)).await {
            Some(KeyTtl::Expires(remaining)) => remaining,
            _ => config.window,
        };
        Err(AdmissionError::rate_limited(
            &config.endpoint,
            config.max_requests,
            retry_after,
        ))
    }

    async fn lock_out(&self, identifier: &str, config: &ProgressiveConfig, violations: u64) -> AdmissionError {
        let lockout_key = config.lockout_key(identifier);
        let index_key = lockout_index_key(&config.endpoint);
        let member = identifier.to_string();
        let duration = config.lockout_duration;

        let written = self
            .breaker
            .execute(|| {
                with_transaction(self.store.clone(), |tx| {
                    Box::pin(async move {
                        tx.set(&lockout_key, "locked", Some(duration)).await?;
                        tx.add_to_set(&index_key, &member).await?;
                        Ok::<_, TransactionError>(())
                    })
                })
            })
            .await;

        match written {
            Ok(()) => {
                tracing::warn!(
                    endpoint = %config.endpoint,
                    identifier = %identifier,
                    violations,
                    lockout_secs = duration.as_secs(),
                    "identifier locked out"
                );
                AdmissionError::Locked {
                    endpoint: config.endpoint.clone(),
                    retry_after_secs: ceil_secs(duration),
                }
            }
            Err(err) => {
                tracing::warn!(
                    endpoint = %config.endpoint,
                    error = %err,
                    "failed to record lockout, denying this request only"
                );
                AdmissionError::rate_limited(&config.endpoint, config.max_requests, config.window)
            }
        }
    }

    /// Identifiers currently locked out of `endpoint`
    ///
    /// Index entries whose lockout has expired are pruned along the way.
    pub async fn list_lockouts(&self, endpoint: &str) -> Result<Vec<LockoutEntry>, AdmissionError> {
        let index_key = lockout_index_key(endpoint);
        let members = self.required(|| self.store.smembers(&index_key)).await?;
        if members.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = members.iter().map(|m| lockout_key(endpoint, m)).collect();
        let values = self.required(|| self.store.mget(&keys)).await?;

        let mut entries = Vec::new();
        for ((identifier, key), value) in members.into_iter().zip(&keys).zip(values) {
            if value.is_none() {
                self.guarded(|| self.store.srem(&index_key, &identifier)).await;
                continue;
            }
            match self.required(|| self.store.ttl(key)).await? {
                KeyTtl::Missing => {}
                ttl => entries.push(LockoutEntry {
                    identifier,
                    retry_after_secs: ttl.as_expiry().map_or(0, ceil_secs),
                }),
            }
        }
        Ok(entries)
    }

    /// Lift a lockout and forget the identifier's violations
    ///
    /// Returns whether a lockout was active. The three keys are cleared in one
    /// compensating transaction.
    pub async fn clear_lockout(&self, endpoint: &str, identifier: &str) -> Result<bool, AdmissionError> {
        let lockout_key = lockout_key(endpoint, identifier);
        let index_key = lockout_index_key(endpoint);
        let violations_key = violations_key(endpoint, identifier);
        let member = identifier.to_string();

        let cleared = self
            .breaker
            .execute(|| {
                with_transaction(self.store.clone(), |tx| {
                    Box::pin(async move {
                        let was_locked = tx.delete(&lockout_key).await?;
                        tx.remove_from_set(&index_key, &member).await?;
                        tx.delete(&violations_key).await?;
                        Ok::<_, TransactionError>(was_locked)
                    })
                })
            })
            .await;

        match cleared {
            Ok(was_locked) => {
                tracing::info!(endpoint = %endpoint, identifier = %identifier, was_locked, "lockout cleared");
                Ok(was_locked)
            }
            Err(CircuitError::Open { .. }) => Err(AdmissionError::unavailable("store")),
            Err(CircuitError::Inner(TransactionError::Store(_))) => Err(AdmissionError::unavailable("store")),
            Err(CircuitError::Inner(err)) => Err(err.into()),
        }
    }

    /// Store call whose failure means "allow"
    async fn guarded<F, Fut, T>(&self, op: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        match self.breaker.execute(op).await {
            Ok(value) => Some(value),
            Err(err) => {
                tracing::warn!(error = %err, "progressive limiter store call failed, allowing");
                None
            }
        }
    }

    /// Store call whose failure surfaces as `DependencyUnavailable`
    async fn required<F, Fut, T>(&self, op: F) -> Result<T, AdmissionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.breaker.execute(op).await.map_err(|err| {
            tracing::warn!(error = %err, "lockout administration store call failed");
            AdmissionError::unavailable("store")
        })
    }
}
