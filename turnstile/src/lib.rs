//! # Turnstile
//!
//! Admission control and resilience primitives for services that sit in front
//! of an expensive or fragile dependency.
//!
//! ## Overview
//!
//! - [`SlidingWindowLimiter`]: distributed sliding-window limits over a
//!   [`SharedStore`], with an instance-local fallback during store outages
//! - [`CircuitBreaker`]: closed / open / half-open gate around any async call
//! - [`Deduplicator`]: at most one execution per idempotency key or content digest
//! - [`with_transaction`]: multi-key store writes with compensating rollback
//! - [`ProgressiveLimiter`]: escalating delays and lockouts for repeat offenders
//! - [`AdmissionGate`]: runs all of the above in order for one request
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use turnstile::{
//!     AdmissionGate, AdmissionRequest, AdmissionSettings, CircuitBreaker,
//!     CircuitBreakerConfig, Criticality, EndpointPolicy, MemoryStore, TrustedProxies,
//! };
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let breaker = Arc::new(CircuitBreaker::new("store", CircuitBreakerConfig::default()));
//! let gate = AdmissionGate::new(
//!     store,
//!     breaker,
//!     AdmissionSettings::default(),
//!     TrustedProxies::default(),
//!     1,
//! );
//!
//! let policy = EndpointPolicy::new("chat", Criticality::Standard).metered();
//! let request = AdmissionRequest {
//!     peer: "203.0.113.9".parse().unwrap(),
//!     forwarded_for: None,
//!     user_id: Some("u1"),
//! };
//!
//! match gate.admit(&request, &policy).await {
//!     Ok(admitted) => println!("admitted {}", admitted.identity.ip),
//!     Err(denied) => println!("{} ({})", denied.public_message(), denied.status_code()),
//! }
//! # });
//! ```
//!
//! ## Failure Policy
//!
//! Whether a store outage admits or rejects traffic is decided by the
//! [`Criticality`] on each limiter and endpoint policy, never implicitly.
//! Standard limiters fail over to per-instance counters; security-critical
//! ones reject with [`AdmissionError::DependencyUnavailable`]. The progressive
//! limiter and the deduplicator always fail open.

pub mod admission;
pub mod circuit_breaker;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod progressive;
pub mod rate_limiter;
pub mod settings;
pub mod store;
pub mod transaction;

pub use admission::{AdmissionGate, AdmissionRequest, Admitted, EndpointPolicy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
pub use dedup::{DedupConfig, DedupKeyError, DedupRequest, Deduplicator};
pub use error::{AdmissionError, StoreError, StoreResult, TransactionError};
pub use identity::{ClientIdentity, IdentifierKind, InvalidProxy, ProxyNet, TrustedProxies};
pub use progressive::{LockoutEntry, ProgressiveConfig, ProgressiveLimiter};
pub use rate_limiter::{
    Criticality, DecisionSource, LocalFallback, RateLimitConfig, RateLimitDecision,
    SlidingWindowLimiter,
};
pub use settings::{AdmissionSettings, Environment, LimitSpec};
pub use store::{FaultInjectingStore, KeyTtl, MemoryStore, SharedStore};
pub use transaction::{RollbackReport, TransactionContext, with_transaction};
