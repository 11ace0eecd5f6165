//! Deployment-wide admission settings

use crate::error::AdmissionError;
use crate::rate_limiter::{Criticality, RateLimitConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!(
                "unknown environment '{other}', expected 'development' or 'production'"
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Environment::Development => "development",
            Environment::Production => "production",
        })
    }
}

/// A request budget: `max_requests` per `window`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    pub max_requests: u32,
    pub window: Duration,
}

impl LimitSpec {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub const fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }

    /// Limiter parameters for `scope` under `criticality`
    pub fn config(&self, scope: impl Into<String>, criticality: Criticality) -> RateLimitConfig {
        RateLimitConfig::new(scope, self.max_requests, self.window, criticality)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub environment: Environment,
    /// Skip the limiters entirely; honoured outside production only
    pub disable_rate_limiting: bool,
    /// Per client address
    pub ip_limit: LimitSpec,
    /// Per authenticated user
    pub user_limit: LimitSpec,
    /// Global quota on metered endpoints, per identifier
    pub global_limit: LimitSpec,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            disable_rate_limiting: false,
            ip_limit: LimitSpec::per_minute(60),
            user_limit: LimitSpec::per_minute(60),
            global_limit: LimitSpec::new(1000, Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl AdmissionSettings {
    /// Whether limiters run for this deployment
    pub fn rate_limiting_enabled(&self) -> bool {
        !self.disable_rate_limiting || self.environment.is_production()
    }

    pub fn validate(&self) -> Result<(), AdmissionError> {
        for (name, limit) in [
            ("ip", self.ip_limit),
            ("user", self.user_limit),
            ("global", self.global_limit),
        ] {
            limit.config(name, Criticality::Standard).validate()?;
        }
        Ok(())
    }
}
