//! Components shared by every request
//!
//! Built once at startup from [`Config`] and handed to the transport behind
//! an `Arc`.

use crate::config::Config;
use crate::metrics::Metrics;
use crate::policy::PolicyTable;
use crate::proxy::Upstream;
use crate::session::SessionResolver;
use anyhow::Result;
use std::sync::Arc;
use turnstile::{
    AdmissionGate, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, Deduplicator,
    SharedStore,
};

/// The process's circuit breakers
pub struct Breakers {
    /// Guards every shared store call
    pub store: Arc<CircuitBreaker>,
    /// Guards forwarding of metered requests
    pub model_api: Arc<CircuitBreaker>,
}

impl Breakers {
    pub fn new(store: CircuitBreakerConfig, model_api: CircuitBreakerConfig) -> Self {
        Self {
            store: Arc::new(CircuitBreaker::new("store", store)),
            model_api: Arc::new(CircuitBreaker::new("model-api", model_api)),
        }
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        vec![self.store.snapshot(), self.model_api.snapshot()]
    }
}

pub struct AppState {
    pub gate: AdmissionGate,
    pub dedup: Deduplicator,
    pub sessions: SessionResolver,
    pub upstream: Upstream,
    pub policies: PolicyTable,
    pub breakers: Breakers,
    pub metrics: Metrics,
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn build(config: &Config, store: Arc<dyn SharedStore>) -> Result<Self> {
        let breakers = Breakers::new(config.store_breaker.clone(), config.model_breaker.clone());

        Ok(Self {
            gate: AdmissionGate::new(
                store.clone(),
                breakers.store.clone(),
                config.admission.clone(),
                config.trusted_proxies.clone(),
                config.instances,
            ),
            dedup: Deduplicator::new(store.clone(), breakers.store.clone(), config.dedup.clone()),
            sessions: SessionResolver::new(store, breakers.store.clone(), &config.session_cookie),
            upstream: Upstream::new(&config.upstream, breakers.model_api.clone())?,
            policies: config.policies.clone(),
            breakers,
            metrics: Metrics::new(),
            admin_token: config.admin_token.clone(),
        })
    }
}
