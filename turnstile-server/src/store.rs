//! Store factory
//!
//! - **memory**: in-process [`MemoryStore`], for a single instance or local
//!   development; counters are not shared between instances
//! - **redis**: [`RedisStore`] shared by the whole fleet

use crate::config::{StoreBackend, StoreConfig};
use crate::redis_store::RedisStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use turnstile::{MemoryStore, SharedStore};

/// Create the configured shared store
///
/// # Errors
///
/// Returns an error if the Redis server cannot be reached at startup.
pub async fn create_store(config: &StoreConfig) -> Result<Arc<dyn SharedStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Redis => {
            let store = RedisStore::connect(
                &config.redis_url,
                config.connect_timeout,
                config.response_timeout,
            )
            .await
            .with_context(|| format!("failed to connect to {}", config.redis_url))?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_backend() {
        let store = create_store(&StoreConfig {
            backend: StoreBackend::Memory,
            redis_url: String::new(),
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
        })
        .await
        .unwrap();

        store.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_invalid_redis_url() {
        let result = create_store(&StoreConfig {
            backend: StoreBackend::Redis,
            redis_url: "not a url".to_string(),
            connect_timeout: Duration::from_secs(1),
            response_timeout: Duration::from_secs(1),
        })
        .await;
        assert!(result.is_err());
    }
}
