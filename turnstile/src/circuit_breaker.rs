//! Circuit breaker for flaky dependencies
//!
//! ```text
//!    ┌────────┐  failures >= failure_threshold   ┌────────┐
//!    │ CLOSED │ ───────────────────────────────► │  OPEN  │
//!    └────────┘                                  └────────┘
//!        ▲                                    open_timeout │ ▲
//!        │ successes >= success_threshold       elapsed    │ │ any failure
//!        │                                                 ▼ │
//!        │                                          ┌───────────┐
//!        └───────────────────────────────────────── │ HALF_OPEN │
//!                                                   └───────────┘
//! ```
//!
//! While open, [`CircuitBreaker::execute`] rejects immediately without running
//! the operation, so an outage does not turn into a flood of doomed network
//! calls. There is no background timer: the move to half-open happens on the
//! first call (or state observation) after the cooldown. Half-open admits one
//! trial call at a time.

use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive trial successes in `HalfOpen` before the circuit closes
    pub success_threshold: u32,
    /// Cooldown spent in `Open` before a trial call is allowed
    pub open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The call was rejected without being attempted
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The call ran and failed
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of a breaker, for health and metrics endpoints
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the last recorded failure
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds until a trial call is allowed (only while open)
    pub next_attempt_in_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    next_attempt_time: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            next_attempt_time: None,
            trial_in_flight: false,
        }
    }
}

/// Tri-state guard around calls to one dependency
///
/// Create one per dependency at startup and share it by `Arc`.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

/// Admission ticket for one guarded call
///
/// A trial permit that is dropped without an outcome (the caller's future was
/// cancelled) frees the half-open slot without counting either way.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn succeeded(mut self) {
        self.settled = true;
        self.breaker.on_success(self.trial);
    }

    fn failed(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.trial);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` under the breaker
    ///
    /// # Errors
    ///
    /// - [`CircuitError::Open`] when the call was not attempted
    /// - [`CircuitError::Inner`] when the call ran and returned an error
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = self.acquire().map_err(|retry_after| CircuitError::Open {
            name: self.name.clone(),
            retry_after,
        })?;

        match operation().await {
            Ok(value) => {
                permit.succeeded();
                Ok(value)
            }
            Err(err) => {
                permit.failed();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Current state, applying a pending open -> half-open transition
    pub fn state(&self) -> CircuitState {
        let mut s = self.state.lock();
        Self::advance(&mut s, Instant::now());
        s.state
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let now = Instant::now();
        let mut s = self.state.lock();
        Self::advance(&mut s, now);
        CircuitSnapshot {
            name: self.name.clone(),
            state: s.state,
            failure_count: s.failure_count,
            success_count: s.success_count,
            last_failure_ms_ago: s
                .last_failure_time
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            next_attempt_in_ms: match s.state {
                CircuitState::Open => s
                    .next_attempt_time
                    .map(|at| at.saturating_duration_since(now).as_millis() as u64),
                _ => None,
            },
        }
    }

    /// Force the breaker back to `Closed` with cleared counters
    pub fn reset(&self) {
        *self.state.lock() = BreakerState::closed();
        tracing::info!(breaker = %self.name, "circuit breaker reset");
    }

    fn advance(s: &mut BreakerState, now: Instant) {
        if s.state == CircuitState::Open && s.next_attempt_time.is_none_or(|at| now >= at) {
            s.state = CircuitState::HalfOpen;
            s.success_count = 0;
            s.trial_in_flight = false;
        }
    }

    fn acquire(&self) -> Result<CallPermit<'_>, Duration> {
        let now = Instant::now();
        let mut s = self.state.lock();
        Self::advance(&mut s, now);

        match s.state {
            CircuitState::Closed => Ok(CallPermit {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => Err(s
                .next_attempt_time
                .map(|at| at.saturating_duration_since(now))
                .unwrap_or(self.config.open_timeout)),
            CircuitState::HalfOpen if s.trial_in_flight => Err(Duration::ZERO),
            CircuitState::HalfOpen => {
                s.trial_in_flight = true;
                tracing::debug!(breaker = %self.name, "circuit half-open, admitting trial call");
                Ok(CallPermit {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
        }
    }

    fn on_success(&self, trial: bool) {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                s.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                if trial {
                    s.trial_in_flight = false;
                }
                s.success_count += 1;
                if s.success_count >= self.config.success_threshold {
                    *s = BreakerState::closed();
                    tracing::info!(breaker = %self.name, "circuit closed after successful trials");
                }
            }
            // A call admitted before the circuit opened; it does not close it
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, trial: bool) {
        let now = Instant::now();
        let mut s = self.state.lock();
        s.success_count = 0;
        s.last_failure_time = Some(now);

        match s.state {
            CircuitState::Closed => {
                s.failure_count += 1;
                if s.failure_count >= self.config.failure_threshold {
                    self.trip(&mut s, now);
                }
            }
            CircuitState::HalfOpen => {
                if trial {
                    s.trial_in_flight = false;
                }
                s.failure_count += 1;
                self.trip(&mut s, now);
            }
            CircuitState::Open => {
                s.failure_count += 1;
            }
        }
    }

    fn trip(&self, s: &mut BreakerState, now: Instant) {
        s.state = CircuitState::Open;
        s.next_attempt_time = Some(now + self.config.open_timeout);
        tracing::warn!(
            breaker = %self.name,
            failures = s.failure_count,
            open_for_ms = self.config.open_timeout.as_millis() as u64,
            "circuit opened"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(failures: u32, successes: u32, open_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                open_timeout: Duration::from_secs(open_secs),
            },
        )
    }

    async fn fail(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<&'static str>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>("boom")
        })
        .await
    }

    async fn succeed(cb: &CircuitBreaker, calls: &AtomicU32) -> Result<(), CircuitError<&'static str>> {
        cb.execute(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<(), &'static str>(())
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_rejects_without_calling() {
        let cb = breaker(3, 2, 10);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(matches!(fail(&cb, &calls).await, Err(CircuitError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        for _ in 0..5 {
            assert!(matches!(succeed(&cb, &calls).await, Err(CircuitError::Open { .. })));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3, "open circuit must not call fn");
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_after_timeout_then_closes() {
        let cb = breaker(2, 2, 10);
        let calls = AtomicU32::new(0);

        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(matches!(succeed(&cb, &calls).await, Err(CircuitError::Open { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_in_half_open_reopens_with_fresh_deadline() {
        let cb = breaker(1, 1, 5);
        let calls = AtomicU32::new(0);

        fail(&cb, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(5)).await;

        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);
        let snap = cb.snapshot();
        assert_eq!(snap.next_attempt_in_ms, Some(5_000));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_one_trial_at_a_time() {
        let cb = Arc::new(breaker(1, 1, 1));
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial = {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.execute(|| async move {
                    let _ = release_rx.await;
                    Ok::<(), &'static str>(())
                })
                .await
            })
        };
        tokio::task::yield_now().await;

        // A second caller is turned away while the trial is in flight
        assert!(matches!(succeed(&cb, &calls).await, Err(CircuitError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        trial.await.unwrap().unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_releases_slot() {
        let cb = breaker(1, 1, 1);
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(1)).await;

        let pending = cb.execute(|| std::future::pending::<Result<(), &'static str>>());
        let timed_out = tokio::time::timeout(Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());

        assert_eq!(cb.state(), CircuitState::HalfOpen);
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = breaker(3, 1, 10);
        let calls = AtomicU32::new(0);

        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();
        succeed(&cb, &calls).await.unwrap();
        assert_eq!(cb.snapshot().failure_count, 0);

        fail(&cb, &calls).await.unwrap_err();
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_reset_closes_open_circuit() {
        let cb = breaker(1, 1, 3600);
        let calls = AtomicU32::new(0);
        fail(&cb, &calls).await.unwrap_err();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        succeed(&cb, &calls).await.unwrap();
    }
}
