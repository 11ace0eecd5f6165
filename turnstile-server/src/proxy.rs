//! Forwarding to the chat application
//!
//! Admitted requests are replayed against the upstream base URL. Requests to
//! metered endpoints run under the `model-api` circuit breaker: transport
//! failures and 5xx answers count as failures, and while the circuit is open
//! they are refused without reaching the upstream. A 5xx answer is still
//! relayed to the client.

use crate::config::UpstreamConfig;
use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use turnstile::{CircuitBreaker, CircuitError};

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub struct ForwardRequest {
    pub method: Method,
    /// Path plus query string, starting with `/`
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Resolved client address, appended to `x-forwarded-for`
    pub client_ip: IpAddr,
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug)]
pub enum ProxyError {
    /// The model API circuit is open; nothing was sent
    CircuitOpen { retry_after: Duration },
    /// The upstream could not be reached or the response was cut short
    Transport(reqwest::Error),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::CircuitOpen { retry_after } => {
                write!(f, "model-api circuit open, retry after {retry_after:?}")
            }
            ProxyError::Transport(err) => write!(f, "upstream request failed: {err}"),
        }
    }
}

impl std::error::Error for ProxyError {}

enum Failure {
    Transport(reqwest::Error),
    ServerError(UpstreamResponse),
}

pub struct Upstream {
    client: reqwest::Client,
    base_url: String,
    model_breaker: Arc<CircuitBreaker>,
}

impl Upstream {
    pub fn new(config: &UpstreamConfig, model_breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            model_breaker,
        })
    }

    pub fn model_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.model_breaker
    }

    /// Forward `request`, under the model API breaker when `metered`
    pub async fn forward(&self, request: ForwardRequest, metered: bool) -> Result<UpstreamResponse, ProxyError> {
        if !metered {
            return self.send(request).await.map_err(ProxyError::Transport);
        }

        let outcome = self
            .model_breaker
            .execute(move || async move {
                let response = self.send(request).await.map_err(Failure::Transport)?;
                if response.status.is_server_error() {
                    Err(Failure::ServerError(response))
                } else {
                    Ok(response)
                }
            })
            .await;

        match outcome {
            Ok(response) => Ok(response),
            Err(CircuitError::Open { retry_after, .. }) => Err(ProxyError::CircuitOpen { retry_after }),
            Err(CircuitError::Inner(Failure::ServerError(response))) => {
                tracing::warn!(status = %response.status, "model API answered with a server error");
                Ok(response)
            }
            Err(CircuitError::Inner(Failure::Transport(err))) => Err(ProxyError::Transport(err)),
        }
    }

    async fn send(&self, request: ForwardRequest) -> Result<UpstreamResponse, reqwest::Error> {
        let url = format!("{}{}", self.base_url, request.path_and_query);
        let headers = forwarded_headers(request.headers, request.client_ip);

        let response = self
            .client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_hop_by_hop(&mut headers);
        let body = response.bytes().await?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

fn forwarded_headers(mut headers: HeaderMap, client_ip: IpAddr) -> HeaderMap {
    strip_hop_by_hop(&mut headers);

    let chain = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {client_ip}"),
        None => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert("x-forwarded-for", value);
    }
    headers
}
