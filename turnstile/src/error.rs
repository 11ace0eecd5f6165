//! Error taxonomy for admission decisions
//!
//! Every component converts its own dependency failures into one of the
//! [`AdmissionError`] variants so callers can map them to a transport status
//! without inspecting raw store or network errors.

use std::time::Duration;
use thiserror::Error;

/// Errors produced by a [`SharedStore`](crate::store::SharedStore) implementation
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached (connection refused, timeout, reset)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store answered but rejected the command (wrong type, bad reply)
    #[error("store command failed: {0}")]
    Command(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors raised by the transaction bookkeeping itself
#[derive(Debug, Clone, Error)]
pub enum TransactionError {
    /// An operation was attempted on a context that was already committed or rolled back
    #[error("transaction already finished")]
    Finished,

    /// Reading the prior state or applying a write failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Reasons a request was refused admission
#[derive(Debug, Clone, Error)]
pub enum AdmissionError {
    /// The identifier exceeded its window; retry after the given delay
    #[error("rate limit exceeded for {scope} (limit {limit}), retry after {retry_after_secs}s")]
    RateLimited {
        scope: String,
        limit: u32,
        retry_after_secs: u64,
    },

    /// Repeated violations put the identifier into a lockout
    #[error("locked out of {endpoint}, retry after {retry_after_secs}s")]
    Locked {
        endpoint: String,
        retry_after_secs: u64,
    },

    /// The store or its circuit is down on a path that must not fail open
    #[error("{dependency} unavailable")]
    DependencyUnavailable { dependency: String },

    /// A request with the same idempotency key is in flight or just completed
    #[error("duplicate request, retry after {retry_after_secs}s")]
    DuplicateRequest { retry_after_secs: u64 },

    /// A multi-key mutation failed and was rolled back
    #[error("transaction failed: {0}")]
    TransactionFailed(#[from] TransactionError),

    /// Limiter parameters that can never admit anything
    #[error("invalid limiter configuration: {0}")]
    InvalidConfig(String),
}

impl AdmissionError {
    pub(crate) fn rate_limited(scope: &str, limit: u32, retry_after: Duration) -> Self {
        AdmissionError::RateLimited {
            scope: scope.to_string(),
            limit,
            retry_after_secs: ceil_secs(retry_after),
        }
    }

    pub(crate) fn unavailable(dependency: &str) -> Self {
        AdmissionError::DependencyUnavailable {
            dependency: dependency.to_string(),
        }
    }

    /// HTTP status the transport layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            AdmissionError::RateLimited { .. } | AdmissionError::Locked { .. } => 429,
            AdmissionError::DependencyUnavailable { .. } => 503,
            AdmissionError::DuplicateRequest { .. } => 409,
            AdmissionError::TransactionFailed(_) | AdmissionError::InvalidConfig(_) => 500,
        }
    }

    /// Machine-readable retry hint in whole seconds, when one applies
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            AdmissionError::RateLimited {
                retry_after_secs, ..
            }
            | AdmissionError::Locked {
                retry_after_secs, ..
            }
            | AdmissionError::DuplicateRequest { retry_after_secs } => Some(*retry_after_secs),
            AdmissionError::DependencyUnavailable { .. } => Some(30),
            AdmissionError::TransactionFailed(_) | AdmissionError::InvalidConfig(_) => None,
        }
    }

    /// Stable short code for response bodies and metrics labels
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::RateLimited { .. } => "rate_limited",
            AdmissionError::Locked { .. } => "locked",
            AdmissionError::DependencyUnavailable { .. } => "dependency_unavailable",
            AdmissionError::DuplicateRequest { .. } => "duplicate_request",
            AdmissionError::TransactionFailed(_) => "transaction_failed",
            AdmissionError::InvalidConfig(_) => "internal_error",
        }
    }

    /// Message safe to show to clients
    ///
    /// Dependency and internal failures never leak diagnostic detail.
    pub fn public_message(&self) -> String {
        match self {
            AdmissionError::RateLimited {
                retry_after_secs, ..
            } => format!("Too many requests. Retry after {retry_after_secs} seconds."),
            AdmissionError::Locked { retry_after_secs, .. } => format!(
                "Too many failed attempts. Retry after {retry_after_secs} seconds."
            ),
            AdmissionError::DependencyUnavailable { .. } => {
                "Service temporarily unavailable. Please try again later.".to_string()
            }
            AdmissionError::DuplicateRequest { .. } => {
                "This request is already being processed.".to_string()
            }
            AdmissionError::TransactionFailed(_) | AdmissionError::InvalidConfig(_) => {
                "Internal server error.".to_string()
            }
        }
    }
}

/// Round a duration up to whole seconds, never below one
pub(crate) fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs() + u64::from(duration.subsec_nanos() > 0);
    secs.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AdmissionError::rate_limited("ip", 10, Duration::from_secs(5)).status_code(),
            429
        );
        assert_eq!(AdmissionError::unavailable("store").status_code(), 503);
        assert_eq!(
            AdmissionError::DuplicateRequest {
                retry_after_secs: 1
            }
            .status_code(),
            409
        );
        assert_eq!(
            AdmissionError::TransactionFailed(TransactionError::Finished).status_code(),
            500
        );
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let err = AdmissionError::rate_limited("user", 3, Duration::from_millis(1500));
        assert_eq!(err.retry_after_secs(), Some(2));

        let err = AdmissionError::rate_limited("user", 3, Duration::ZERO);
        assert_eq!(err.retry_after_secs(), Some(1));
    }

    #[test]
    fn test_public_message_hides_dependency_detail() {
        let err = AdmissionError::unavailable("redis://10.0.0.3:6379");
        assert!(!err.public_message().contains("10.0.0.3"));
        assert_eq!(err.code(), "dependency_unavailable");
    }
}
