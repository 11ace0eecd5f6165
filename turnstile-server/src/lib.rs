//! # Turnstile Server
//!
//! An HTTP gateway that puts the [`turnstile`] admission layer in front of a
//! chat application whose requests spend money on a metered model API.
//!
//! ## Request Flow
//!
//! ```text
//!  client ──► policy lookup ──► session lookup ──► AdmissionGate ──► Deduplicator ──► upstream
//!             (longest prefix)   (session:<id>)    (circuit, IP,     (mutating requests  (model-api
//!                                                   user, global,     on dedupe           breaker when
//!                                                   progressive)      endpoints)          metered)
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! # Single instance, in-process store
//! turnstile-server --upstream-url http://127.0.0.1:3000
//!
//! # Fleet of four sharing Redis, behind a load balancer on 10.0.0.0/8
//! turnstile-server --store redis --redis-url redis://cache:6379 \
//!   --instances 4 --trusted-proxies 10.0.0.0/8 --environment production
//!
//! # List all environment variables
//! turnstile-server --list-env-vars
//! ```
//!
//! ## Endpoint Policies
//!
//! Each endpoint declares its criticality, whether it is metered, whether
//! mutating requests are deduplicated, and optional progressive penalties.
//! See [`policy`] for the file format; without a policy file the built-in
//! table applies.
//!
//! ## Operations
//!
//! - `GET /health`: breaker states
//! - `GET /metrics`: Prometheus counters
//! - `/admin/lockouts/...`: list and clear lockouts (with `--admin-token`)

pub mod config;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod redis_store;
pub mod session;
pub mod state;
pub mod store;
pub mod transport;
