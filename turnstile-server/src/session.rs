//! Session lookup
//!
//! The chat application stores sessions as `session:<id>` JSON records with a
//! `user_id` field. The gateway only reads them to attribute requests to a
//! user; a missing cookie, unknown session, malformed record or store failure
//! all mean the request is anonymous.

use axum::http::HeaderMap;
use axum::http::header::COOKIE;
use serde::Deserialize;
use std::sync::Arc;
use turnstile::{CircuitBreaker, SharedStore};

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Deserialize)]
struct SessionRecord {
    user_id: Option<String>,
}

pub struct SessionResolver {
    store: Arc<dyn SharedStore>,
    breaker: Arc<CircuitBreaker>,
    cookie_name: String,
}

impl SessionResolver {
    pub fn new(store: Arc<dyn SharedStore>, breaker: Arc<CircuitBreaker>, cookie_name: impl Into<String>) -> Self {
        Self {
            store,
            breaker,
            cookie_name: cookie_name.into(),
        }
    }

    /// The session id from the request cookies, if it is well formed
    pub fn session_id<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(name, _)| *name == self.cookie_name)
            .map(|(_, id)| id.trim())
            .filter(|id| valid_session_id(id))
    }

    /// User id of the session carried by `headers`, `None` for anonymous
    pub async fn user_id(&self, headers: &HeaderMap) -> Option<String> {
        let id = self.session_id(headers)?;
        let key = format!("session:{id}");

        let raw = match self.breaker.execute(|| self.store.get(&key)).await {
            Ok(raw) => raw?,
            Err(err) => {
                tracing::debug!(error = %err, "session lookup failed, treating as anonymous");
                return None;
            }
        };

        match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) => record.user_id.filter(|user| !user.is_empty()),
            Err(err) => {
                tracing::debug!(error = %err, "malformed session record");
                None
            }
        }
    }
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
