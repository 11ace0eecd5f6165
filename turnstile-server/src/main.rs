use anyhow::Result;
use std::sync::Arc;
use tokio::task::JoinSet;

use turnstile_server::config::Config;
use turnstile_server::state::AppState;
use turnstile_server::store;
use turnstile_server::transport::{Transport, http::HttpTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse configuration from environment variables and CLI arguments
    let config = Config::from_env_and_args()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("turnstile={}", config.log_level).parse()?)
                .add_directive(format!("turnstile_server={}", config.log_level).parse()?),
        )
        .init();

    let store = store::create_store(&config.store).await?;
    let state = Arc::new(AppState::build(&config, store)?);

    tracing::info!(
        store = ?config.store.backend,
        instances = config.instances,
        environment = %config.admission.environment,
        endpoints = config.policies.len(),
        upstream = %config.upstream.base_url,
        "Turnstile gateway starting"
    );
    if !config.admission.rate_limiting_enabled() {
        tracing::warn!("rate limiting is disabled");
    } else if config.admission.disable_rate_limiting {
        tracing::warn!("ignoring disabled rate limiting in production");
    }

    let mut transport_tasks = JoinSet::new();

    let transport = HttpTransport::new(&config.http.host, config.http.port)?;
    let http_state = state.clone();
    transport_tasks.spawn(async move { transport.start(http_state).await });

    while let Some(result) = transport_tasks.join_next().await {
        match result {
            Ok(Ok(())) => {
                tracing::info!("Transport task completed successfully");
            }
            Ok(Err(e)) => {
                tracing::error!("Transport task failed: {}", e);
                return Err(e);
            }
            Err(e) => {
                tracing::error!("Transport task panicked: {}", e);
                return Err(anyhow::anyhow!("Transport task panicked"));
            }
        }
    }

    Ok(())
}
