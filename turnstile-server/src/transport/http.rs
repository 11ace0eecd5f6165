//! HTTP gateway
//!
//! # Routes
//!
//! - `GET /health`: `OK` plus the circuit breaker snapshots, as JSON
//! - `GET /metrics`: Prometheus text format
//! - `GET /admin/lockouts/{endpoint}`: locked-out identifiers with remaining time
//! - `DELETE /admin/lockouts/{endpoint}/{identifier}`: lift a lockout
//! - anything else: matched to an endpoint policy, admitted, and forwarded
//!
//! The admin routes exist only when an admin token is configured and require
//! `Authorization: Bearer <token>`.
//!
//! # Gateway responses
//!
//! Forwarded responses carry `x-ratelimit-limit` and `x-ratelimit-remaining`
//! from the tightest limit that applied. Refusals answer with the status of
//! the admission error, a `retry-after` header where one applies, and
//!
//! ```json
//! { "error": "rate_limited", "message": "Too many requests. Retry after 30 seconds.", "retry_after": 30 }
//! ```

use super::Transport;
use crate::metrics::Outcome;
use crate::proxy::{ForwardRequest, ProxyError};
use crate::state::AppState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::header::IntoHeaderName;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get};
use axum::Router;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use turnstile::{
    AdmissionError, AdmissionRequest, Admitted, CircuitSnapshot, DedupRequest, LockoutEntry,
    RateLimitDecision,
};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Error response format
#[derive(Debug, Serialize)]
pub struct HttpErrorResponse {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub breakers: Vec<CircuitSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct LockoutsResponse {
    pub endpoint: String,
    pub lockouts: Vec<LockoutEntry>,
}

#[derive(Debug, Serialize)]
pub struct ClearLockoutResponse {
    pub endpoint: String,
    pub identifier: String,
    pub cleared: bool,
}

pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid HTTP listen address {host}:{port}"))?;
        Ok(Self { addr })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(self, state: Arc<AppState>) -> Result<()> {
        let app = router(state);

        tracing::info!("HTTP gateway listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

/// The gateway router; needs `ConnectInfo<SocketAddr>` for the peer address
pub fn router(state: Arc<AppState>) -> Router {
    let mut app = Router::new()
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics));

    if state.admin_token.is_some() {
        let admin = Router::new()
            .route("/lockouts/{endpoint}", get(handle_list_lockouts))
            .route(
                "/lockouts/{endpoint}/{identifier}",
                delete(handle_clear_lockout),
            )
            .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));
        app = app.nest("/admin", admin);
    }

    app.fallback(handle_gateway).with_state(state)
}

/// Why a gateway request did not get an upstream answer
#[derive(Debug)]
pub enum GatewayError {
    Admission(AdmissionError),
    Proxy(ProxyError),
    PayloadTooLarge,
    NoRoute,
}

impl From<AdmissionError> for GatewayError {
    fn from(err: AdmissionError) -> Self {
        GatewayError::Admission(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            GatewayError::Admission(err) => return admission_response(&err),
            GatewayError::Proxy(ProxyError::CircuitOpen { retry_after }) => {
                let retry_after = retry_after.as_secs().max(1);
                let mut response = error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    HttpErrorResponse {
                        error: "dependency_unavailable",
                        message: "Service temporarily unavailable. Please try again later."
                            .to_string(),
                        retry_after: Some(retry_after),
                    },
                );
                insert_number(response.headers_mut(), header::RETRY_AFTER, retry_after);
                return response;
            }
            GatewayError::Proxy(ProxyError::Transport(_)) => (
                StatusCode::BAD_GATEWAY,
                HttpErrorResponse {
                    error: "bad_gateway",
                    message: "The upstream service did not respond.".to_string(),
                    retry_after: None,
                },
            ),
            GatewayError::PayloadTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                HttpErrorResponse {
                    error: "payload_too_large",
                    message: format!("Request bodies are limited to {MAX_BODY_BYTES} bytes."),
                    retry_after: None,
                },
            ),
            GatewayError::NoRoute => (
                StatusCode::NOT_FOUND,
                HttpErrorResponse {
                    error: "not_found",
                    message: "No endpoint matches this path.".to_string(),
                    retry_after: None,
                },
            ),
        };
        error_response(status, body)
    }
}

fn error_response(status: StatusCode, body: HttpErrorResponse) -> Response {
    (status, Json(body)).into_response()
}

fn admission_response(err: &AdmissionError) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = error_response(
        status,
        HttpErrorResponse {
            error: err.code(),
            message: err.public_message(),
            retry_after: err.retry_after_secs(),
        },
    );

    let headers = response.headers_mut();
    if let Some(retry_after) = err.retry_after_secs() {
        insert_number(headers, header::RETRY_AFTER, retry_after);
    }
    if let AdmissionError::RateLimited { limit, .. } = err {
        insert_number(headers, "x-ratelimit-limit", u64::from(*limit));
        insert_number(headers, "x-ratelimit-remaining", 0);
    }
    response
}

fn insert_number<K: IntoHeaderName>(headers: &mut HeaderMap, name: K, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

fn insert_rate_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    insert_number(headers, "x-ratelimit-limit", u64::from(decision.limit));
    insert_number(headers, "x-ratelimit-remaining", u64::from(decision.remaining));
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "OK",
        breakers: state.breakers.snapshots(),
    })
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state
            .metrics
            .export_prometheus(&state.breakers.snapshots()),
    )
}

struct Forwarded {
    response: Response,
    degraded: bool,
}

async fn handle_gateway(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let started = Instant::now();
    let result = gateway(&state, peer, request).await;
    let latency_us = started.elapsed().as_micros() as u64;

    match result {
        Ok(forwarded) => {
            state.metrics.record(
                Outcome::Allowed {
                    degraded: forwarded.degraded,
                },
                latency_us,
            );
            forwarded.response
        }
        Err(err) => {
            match &err {
                GatewayError::Admission(admission) => {
                    state.metrics.record(Outcome::Denied(admission), latency_us)
                }
                GatewayError::Proxy(proxy) => {
                    tracing::warn!(error = %proxy, "upstream request failed");
                    state.metrics.record(Outcome::UpstreamError, latency_us)
                }
                GatewayError::PayloadTooLarge | GatewayError::NoRoute => {}
            }
            err.into_response()
        }
    }
}

async fn gateway(
    state: &AppState,
    peer: SocketAddr,
    request: Request,
) -> Result<Forwarded, GatewayError> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let policy = state
        .policies
        .resolve(&path)
        .ok_or(GatewayError::NoRoute)?
        .clone();

    let body = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|_| GatewayError::PayloadTooLarge)?;

    let user_id = state.sessions.user_id(&parts.headers).await;
    let forwarded_for = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let admission = AdmissionRequest {
        peer: peer.ip(),
        forwarded_for: forwarded_for.as_deref(),
        user_id: user_id.as_deref(),
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or_else(|| path.clone(), |pq| pq.as_str().to_string());
    let dedupe = policy.dedupe && is_mutating(&parts.method);
    let metered = policy.metered;

    state
        .gate
        .guard(&admission, &policy, |admitted: Admitted| async move {
            let forward = ForwardRequest {
                method: parts.method.clone(),
                path_and_query,
                headers: parts.headers.clone(),
                body: body.clone(),
                client_ip: admitted.identity.ip,
            };
            let requester = admitted.identity.principal();

            let run = move || async move {
                let upstream = state
                    .upstream
                    .forward(forward, metered)
                    .await
                    .map_err(GatewayError::Proxy)?;
                let mut response =
                    (upstream.status, upstream.headers, Body::from(upstream.body)).into_response();
                if let Some(decision) = &admitted.tightest {
                    insert_rate_headers(response.headers_mut(), decision);
                }
                Ok::<_, GatewayError>(Forwarded {
                    response,
                    degraded: admitted.degraded(),
                })
            };

            if dedupe {
                let headers: Vec<(String, Vec<u8>)> = parts
                    .headers
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                    .collect();
                let dedup_request = DedupRequest {
                    method: parts.method.as_str(),
                    path: &path,
                    requester: Some(&requester),
                    headers: &headers,
                    body: Some(&body),
                };
                state.dedup.dedupe(&dedup_request, run).await
            } else {
                run().await
            }
        })
        .await
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

async fn require_admin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let authorized = match (presented, state.admin_token.as_deref()) {
        (Some(presented), Some(expected)) => tokens_match(presented, expected),
        _ => false,
    };

    if !authorized {
        return error_response(
            StatusCode::UNAUTHORIZED,
            HttpErrorResponse {
                error: "unauthorized",
                message: "A valid admin token is required.".to_string(),
                retry_after: None,
            },
        );
    }
    next.run(request).await
}

/// Comparison whose time does not depend on where the tokens differ
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len()
        && presented
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

fn has_lockouts(state: &AppState, endpoint: &str) -> bool {
    state.policies.policies().any(|policy| {
        policy
            .progressive
            .as_ref()
            .is_some_and(|p| p.endpoint == endpoint && p.enable_account_lockout)
    })
}

async fn handle_list_lockouts(
    State(state): State<Arc<AppState>>,
    Path(endpoint): Path<String>,
) -> Result<Json<LockoutsResponse>, GatewayError> {
    if !has_lockouts(&state, &endpoint) {
        return Err(GatewayError::NoRoute);
    }
    let lockouts = state.gate.progressive().list_lockouts(&endpoint).await?;
    Ok(Json(LockoutsResponse { endpoint, lockouts }))
}

async fn handle_clear_lockout(
    State(state): State<Arc<AppState>>,
    Path((endpoint, identifier)): Path<(String, String)>,
) -> Result<Json<ClearLockoutResponse>, GatewayError> {
    if !has_lockouts(&state, &endpoint) {
        return Err(GatewayError::NoRoute);
    }
    let cleared = state
        .gate
        .progressive()
        .clear_lockout(&endpoint, &identifier)
        .await?;
    tracing::info!(endpoint = %endpoint, identifier = %identifier, cleared, "lockout cleared by admin");
    Ok(Json(ClearLockoutResponse {
        endpoint,
        identifier,
        cleared,
    }))
}
