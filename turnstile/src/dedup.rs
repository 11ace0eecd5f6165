//! At-most-one execution per logical request
//!
//! A request is identified either by a client-supplied idempotency token or,
//! failing that, by a SHA-256 digest of its method, path, selected headers,
//! body and the current one-second bucket. Both are scoped to the requester,
//! so one client can neither reuse nor block another client's key. The first request with a given key
//! takes a store lock with set-if-absent; anything arriving while the lock is
//! held is rejected as a duplicate.
//!
//! The lock is deleted when the handler succeeds. When the handler fails (or
//! its future is dropped) the lock is left to expire, so a client retrying a
//! failed request inside the TTL is told to back off.

use crate::circuit_breaker::CircuitBreaker;
use crate::error::{AdmissionError, ceil_secs};
use crate::rate_limiter::epoch_millis;
use crate::store::{KeyTtl, SharedStore};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;

const MAX_TOKEN_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// Lifetime of a lock left behind by a failed or abandoned request
    pub ttl: Duration,
    /// Headers mixed into the content digest (lowercase)
    pub header_names: Vec<String>,
    /// Header carrying the client idempotency token (lowercase)
    pub idempotency_header: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            header_names: vec!["authorization".to_string()],
            idempotency_header: "idempotency-key".to_string(),
        }
    }
}

/// The parts of a request that identify it
#[derive(Debug, Clone, Copy)]
pub struct DedupRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// Who sent the request, such as `user:u1` or `ip:203.0.113.9`
    pub requester: Option<&'a str>,
    /// Header name (lowercase) and raw value pairs
    pub headers: &'a [(String, Vec<u8>)],
    /// `None` when the body could not be read
    pub body: Option<&'a [u8]>,
}

impl<'a> DedupRequest<'a> {
    fn header(&self, name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DedupKeyError {
    #[error("idempotency token is not valid UTF-8")]
    NonUtf8Token,

    #[error("idempotency token must be 1 to {MAX_TOKEN_LEN} visible characters")]
    MalformedToken,

    #[error("request body could not be read")]
    UnreadableBody,
}

pub struct Deduplicator {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn SharedStore>, breaker: Arc<CircuitBreaker>, config: DedupConfig) -> Self {
        Self {
            store,
            breaker,
            config,
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Store key for `request` at `now`
    ///
    /// A present idempotency token always wins over the content digest.
    pub fn derive_key(&self, request: &DedupRequest<'_>, now: SystemTime) -> Result<String, DedupKeyError> {
        if let Some(raw) = request.header(&self.config.idempotency_header) {
            let token = std::str::from_utf8(raw).map_err(|_| DedupKeyError::NonUtf8Token)?;
            let token = token.trim();
            if token.is_empty()
                || token.len() > MAX_TOKEN_LEN
                || token.chars().any(|c| c.is_control() || c.is_whitespace())
            {
                return Err(DedupKeyError::MalformedToken);
            }
            return Ok(match request.requester {
                Some(requester) => format!("dedup:token:{requester}:{token}"),
                None => format!("dedup:token:{token}"),
            });
        }

        let body = request.body.ok_or(DedupKeyError::UnreadableBody)?;
        let bucket = epoch_millis(now) / 1000;

        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        field(request.requester.unwrap_or_default().as_bytes());
        field(request.method.as_bytes());
        field(request.path.as_bytes());
        for name in &self.config.header_names {
            field(name.as_bytes());
            field(request.header(name).unwrap_or_default());
        }
        field(body);
        field(bucket.to_be_bytes().as_slice());

        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
        Ok(format!("dedup:hash:{hex}"))
    }

    /// Run `handler` unless an identical request holds the lock
    ///
    /// # Errors
    ///
    /// [`AdmissionError::DuplicateRequest`] (converted into `E`) when the lock
    /// is held; otherwise whatever `handler` returns.
    pub async fn dedupe<F, Fut, T, E>(&self, request: &DedupRequest<'_>, handler: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        self.dedupe_at(request, SystemTime::now(), handler).await
    }

    /// Like [`dedupe`](Self::dedupe) with an explicit clock reading for the digest bucket
    pub async fn dedupe_at<F, Fut, T, E>(
        &self,
        request: &DedupRequest<'_>,
        now: SystemTime,
        handler: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<AdmissionError>,
    {
        let key = match self.derive_key(request, now) {
            Ok(key) => key,
            Err(err) => {
                tracing::warn!(error = %err, path = %request.path, "dedup key derivation failed, running without deduplication");
                return handler().await;
            }
        };

        let owner = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .breaker
            .execute(|| self.store.set_if_absent(&key, &owner, self.config.ttl))
            .await;

        match acquired {
            Ok(true) => {}
            Ok(false) => {
                let retry_after_secs = self.remaining_lock_secs(&key).await;
                tracing::debug!(key = %key, retry_after_secs, "duplicate request rejected");
                return Err(AdmissionError::DuplicateRequest { retry_after_secs }.into());
            }
            Err(err) => {
                tracing::warn!(error = %err, "dedup lock unavailable, running without deduplication");
                return handler().await;
            }
        }

        let result = handler().await;
        match &result {
            Ok(_) => self.release(&key, &owner).await,
            Err(_) => tracing::debug!(key = %key, "handler failed, dedup lock left to expire"),
        }
        result
    }

    async fn remaining_lock_secs(&self, key: &str) -> u64 {
        match self.breaker.execute(|| self.store.ttl(key)).await {
            Ok(KeyTtl::Expires(remaining)) => ceil_secs(remaining),
            _ => ceil_secs(self.config.ttl),
        }
    }

    async fn release(&self, key: &str, owner: &str) {
        let released = self
            .breaker
            .execute(|| async {
                // Only the holder deletes; an expired lock may belong to a newer request
                match self.store.get(key).await {
                    Ok(Some(current)) if current == owner => self.store.delete(key).await,
                    Ok(_) => Ok(false),
                    Err(err) => Err(err),
                }
            })
            .await;

        if let Err(err) = released {
            tracing::warn!(key = %key, error = %err, "failed to release dedup lock");
        }
    }
}
