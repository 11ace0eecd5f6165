//! Network transports for the gateway
//!
//! Only HTTP is served; the trait keeps startup uniform in `main`.

pub mod http;


use crate::state::AppState;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Transport {
    /// Bind, then serve requests until the listener fails
    async fn start(self, state: Arc<AppState>) -> Result<()>;
}
