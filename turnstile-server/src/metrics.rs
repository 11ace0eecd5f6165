//! Gateway metrics
//!
//! Atomic counters only; nothing on the request path allocates. Breaker
//! states are read at export time from their snapshots.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use turnstile::{AdmissionError, CircuitSnapshot, CircuitState};

/// How one gateway request ended
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    /// Admitted and forwarded; `degraded` when a limit came from the local fallback
    Allowed { degraded: bool },
    /// Refused by the admission layer
    Denied(&'a AdmissionError),
    /// Admitted but the upstream could not answer
    UpstreamError,
}

pub struct Metrics {
    start_time: Instant,

    pub total_requests: AtomicU64,
    pub requests_allowed: AtomicU64,
    pub requests_errors: AtomicU64,

    /// Denials by reason
    pub denied_rate_limited: AtomicU64,
    pub denied_locked: AtomicU64,
    pub denied_unavailable: AtomicU64,
    pub denied_duplicate: AtomicU64,
    pub denied_internal: AtomicU64,

    /// Admissions decided from the instance-local fallback
    pub fallback_decisions: AtomicU64,

    /// Request latency buckets
    pub latency_under_1ms: AtomicU64,
    pub latency_under_10ms: AtomicU64,
    pub latency_under_100ms: AtomicU64,
    pub latency_under_1s: AtomicU64,
    pub latency_over_1s: AtomicU64,

    pub latency_sum_micros: AtomicU64,
    pub latency_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            requests_allowed: AtomicU64::new(0),
            requests_errors: AtomicU64::new(0),
            denied_rate_limited: AtomicU64::new(0),
            denied_locked: AtomicU64::new(0),
            denied_unavailable: AtomicU64::new(0),
            denied_duplicate: AtomicU64::new(0),
            denied_internal: AtomicU64::new(0),
            fallback_decisions: AtomicU64::new(0),
            latency_under_1ms: AtomicU64::new(0),
            latency_under_10ms: AtomicU64::new(0),
            latency_under_100ms: AtomicU64::new(0),
            latency_under_1s: AtomicU64::new(0),
            latency_over_1s: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            latency_count: AtomicU64::new(0),
        }
    }

    /// Record a finished request and its latency
    pub fn record(&self, outcome: Outcome<'_>, latency_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Outcome::Allowed { degraded } => {
                self.requests_allowed.fetch_add(1, Ordering::Relaxed);
                if degraded {
                    self.fallback_decisions.fetch_add(1, Ordering::Relaxed);
                }
            }
            Outcome::Denied(err) => {
                let counter = match err {
                    AdmissionError::RateLimited { .. } => &self.denied_rate_limited,
                    AdmissionError::Locked { .. } => &self.denied_locked,
                    AdmissionError::DependencyUnavailable { .. } => &self.denied_unavailable,
                    AdmissionError::DuplicateRequest { .. } => &self.denied_duplicate,
                    AdmissionError::TransactionFailed(_) | AdmissionError::InvalidConfig(_) => {
                        &self.denied_internal
                    }
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::UpstreamError => {
                self.requests_errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        match latency_us {
            0..=999 => self.latency_under_1ms.fetch_add(1, Ordering::Relaxed),
            1000..=9999 => self.latency_under_10ms.fetch_add(1, Ordering::Relaxed),
            10000..=99999 => self.latency_under_100ms.fetch_add(1, Ordering::Relaxed),
            100000..=999999 => self.latency_under_1s.fetch_add(1, Ordering::Relaxed),
            _ => self.latency_over_1s.fetch_add(1, Ordering::Relaxed),
        };

        self.latency_sum_micros
            .fetch_add(latency_us, Ordering::Relaxed);
        self.latency_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn requests_denied(&self) -> u64 {
        [
            &self.denied_rate_limited,
            &self.denied_locked,
            &self.denied_unavailable,
            &self.denied_duplicate,
            &self.denied_internal,
        ]
        .iter()
        .map(|c| c.load(Ordering::Relaxed))
        .sum()
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self, breakers: &[CircuitSnapshot]) -> String {
        let mut output = String::with_capacity(2048);

        output.push_str("# HELP turnstile_uptime_seconds Time since server start in seconds\n");
        output.push_str("# TYPE turnstile_uptime_seconds gauge\n");
        output.push_str(&format!(
            "turnstile_uptime_seconds {}\n\n",
            self.uptime_seconds()
        ));

        output.push_str("# HELP turnstile_requests_total Total number of gateway requests\n");
        output.push_str("# TYPE turnstile_requests_total counter\n");
        output.push_str(&format!(
            "turnstile_requests_total {}\n\n",
            self.total_requests.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP turnstile_requests_allowed Requests admitted and forwarded\n");
        output.push_str("# TYPE turnstile_requests_allowed counter\n");
        output.push_str(&format!(
            "turnstile_requests_allowed {}\n\n",
            self.requests_allowed.load(Ordering::Relaxed)
        ));

        output.push_str("# HELP turnstile_requests_denied Requests refused, by reason\n");
        output.push_str("# TYPE turnstile_requests_denied counter\n");
        for (reason, counter) in [
            ("rate_limited", &self.denied_rate_limited),
            ("locked", &self.denied_locked),
            ("dependency_unavailable", &self.denied_unavailable),
            ("duplicate_request", &self.denied_duplicate),
            ("internal_error", &self.denied_internal),
        ] {
            output.push_str(&format!(
                "turnstile_requests_denied{{reason=\"{reason}\"}} {}\n",
                counter.load(Ordering::Relaxed)
            ));
        }
        output.push('\n');

        output.push_str("# HELP turnstile_upstream_errors Admitted requests the upstream failed\n");
        output.push_str("# TYPE turnstile_upstream_errors counter\n");
        output.push_str(&format!(
            "turnstile_upstream_errors {}\n\n",
            self.requests_errors.load(Ordering::Relaxed)
        ));

        output.push_str(
            "# HELP turnstile_fallback_decisions Admissions decided by the local fallback\n",
        );
        output.push_str("# TYPE turnstile_fallback_decisions counter\n");
        output.push_str(&format!(
            "turnstile_fallback_decisions {}\n\n",
            self.fallback_decisions.load(Ordering::Relaxed)
        ));

        output.push_str(
            "# HELP turnstile_circuit_state Circuit state (0 closed, 1 half-open, 2 open)\n",
        );
        output.push_str("# TYPE turnstile_circuit_state gauge\n");
        for snapshot in breakers {
            let value = match snapshot.state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            output.push_str(&format!(
                "turnstile_circuit_state{{breaker=\"{}\"}} {value}\n",
                snapshot.name
            ));
        }
        output.push('\n');

        output.push_str("# HELP turnstile_circuit_failures Consecutive failures per circuit\n");
        output.push_str("# TYPE turnstile_circuit_failures gauge\n");
        for snapshot in breakers {
            output.push_str(&format!(
                "turnstile_circuit_failures{{breaker=\"{}\"}} {}\n",
                snapshot.name, snapshot.failure_count
            ));
        }
        output.push('\n');

        let under_1ms = self.latency_under_1ms.load(Ordering::Relaxed);
        let under_10ms = under_1ms + self.latency_under_10ms.load(Ordering::Relaxed);
        let under_100ms = under_10ms + self.latency_under_100ms.load(Ordering::Relaxed);
        let under_1s = under_100ms + self.latency_under_1s.load(Ordering::Relaxed);

        output.push_str("# HELP turnstile_request_duration Request latency distribution\n");
        output.push_str("# TYPE turnstile_request_duration histogram\n");
        for (le, count) in [
            ("0.001", under_1ms),
            ("0.01", under_10ms),
            ("0.1", under_100ms),
            ("1", under_1s),
        ] {
            output.push_str(&format!(
                "turnstile_request_duration_bucket{{le=\"{le}\"}} {count}\n"
            ));
        }
        output.push_str(&format!(
            "turnstile_request_duration_bucket{{le=\"+Inf\"}} {}\n",
            self.latency_count.load(Ordering::Relaxed)
        ));

        let latency_sum_seconds =
            self.latency_sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!(
            "turnstile_request_duration_sum {latency_sum_seconds:.6}\n"
        ));
        output.push_str(&format!(
            "turnstile_request_duration_count {}\n",
            self.latency_count.load(Ordering::Relaxed)
        ));

        output
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
