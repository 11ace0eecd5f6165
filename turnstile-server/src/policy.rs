//! Endpoint policy table
//!
//! Maps request paths to [`EndpointPolicy`] values by longest matching prefix.
//! The table is read from a TOML file:
//!
//! ```toml
//! [[endpoints]]
//! name = "chat"
//! prefix = "/api/chat"
//! criticality = "standard"
//! metered = true
//! dedupe = true
//!
//! [[endpoints]]
//! name = "login"
//! prefix = "/auth/login"
//! criticality = "security_critical"
//!
//! [endpoints.progressive]
//! max_requests = 5
//! window_secs = 900
//! lockout_threshold = 5
//! lockout_duration_secs = 900
//! ```
//!
//! `criticality` has no default: an entry without it fails to load.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use turnstile::{Criticality, EndpointPolicy, LimitSpec, ProgressiveConfig};

#[derive(Debug, Deserialize)]
struct PolicyFile {
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    name: String,
    prefix: String,
    criticality: Criticality,
    #[serde(default)]
    metered: bool,
    #[serde(default)]
    dedupe: bool,
    rate_limit: Option<LimitEntry>,
    progressive: Option<ProgressiveEntry>,
}

#[derive(Debug, Deserialize)]
struct LimitEntry {
    max_requests: u32,
    window_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ProgressiveEntry {
    max_requests: u32,
    window_secs: u64,
    lockout_threshold: u32,
    lockout_duration_secs: u64,
    #[serde(default = "enabled")]
    enable_progressive_delay: bool,
    #[serde(default = "enabled")]
    enable_account_lockout: bool,
}

fn enabled() -> bool {
    true
}

impl EndpointEntry {
    fn into_route(self) -> Result<(String, EndpointPolicy)> {
        if !self.prefix.starts_with('/') {
            return Err(anyhow!(
                "endpoint '{}': prefix '{}' must start with '/'",
                self.name,
                self.prefix
            ));
        }

        let mut policy = EndpointPolicy::new(&self.name, self.criticality);
        policy.metered = self.metered;
        policy.dedupe = self.dedupe;

        if let Some(limit) = self.rate_limit {
            let spec = LimitSpec::new(limit.max_requests, Duration::from_secs(limit.window_secs));
            spec.config(&self.name, self.criticality)
                .validate()
                .with_context(|| format!("endpoint '{}': rate_limit", self.name))?;
            policy = policy.with_rate_limit(spec);
        }

        if let Some(p) = self.progressive {
            let config = ProgressiveConfig {
                endpoint: self.name.clone(),
                max_requests: p.max_requests,
                window: Duration::from_secs(p.window_secs),
                lockout_threshold: p.lockout_threshold,
                lockout_duration: Duration::from_secs(p.lockout_duration_secs),
                enable_progressive_delay: p.enable_progressive_delay,
                enable_account_lockout: p.enable_account_lockout,
            };
            config
                .validate()
                .with_context(|| format!("endpoint '{}': progressive", self.name))?;
            policy = policy.with_progressive(config);
        }

        Ok((self.prefix, policy))
    }
}

/// Path-prefix routing table of endpoint policies
#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    /// Sorted by prefix length, longest first
    routes: Vec<(String, Arc<EndpointPolicy>)>,
}

impl PolicyTable {
    /// Load the table from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let file: PolicyFile = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| format!("failed to load policy file {}", path.display()))?;
        Self::from_entries(file.endpoints)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let file: PolicyFile = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .and_then(|c| c.try_deserialize())
            .context("failed to parse policy table")?;
        Self::from_entries(file.endpoints)
    }

    /// The table used when no policy file is configured
    ///
    /// Chat completions are metered and deduplicated, login is
    /// security-critical with lockouts, everything else is standard.
    pub fn builtin() -> Self {
        let routes = vec![
            (
                "/api/chat".to_string(),
                EndpointPolicy::new("chat", Criticality::Standard)
                    .metered()
                    .deduplicated(),
            ),
            (
                "/auth/login".to_string(),
                EndpointPolicy::new("login", Criticality::SecurityCritical)
                    .with_progressive(ProgressiveConfig::new("login")),
            ),
            (
                "/".to_string(),
                EndpointPolicy::new("default", Criticality::Standard),
            ),
        ];
        Self::from_routes(routes)
    }

    fn from_entries(entries: Vec<EndpointEntry>) -> Result<Self> {
        let mut names = HashSet::new();
        let mut prefixes = HashSet::new();
        let mut routes = Vec::with_capacity(entries.len());

        for entry in entries {
            if !names.insert(entry.name.clone()) {
                return Err(anyhow!("duplicate endpoint name '{}'", entry.name));
            }
            if !prefixes.insert(entry.prefix.clone()) {
                return Err(anyhow!("duplicate endpoint prefix '{}'", entry.prefix));
            }
            routes.push(entry.into_route()?);
        }

        Ok(Self::from_routes(routes))
    }

    fn from_routes(routes: Vec<(String, EndpointPolicy)>) -> Self {
        let mut routes: Vec<_> = routes
            .into_iter()
            .map(|(prefix, policy)| (prefix, Arc::new(policy)))
            .collect();
        routes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Policy for `path`, matching whole path segments
    pub fn resolve(&self, path: &str) -> Option<&Arc<EndpointPolicy>> {
        self.routes
            .iter()
            .find(|(prefix, _)| prefix_matches(prefix, path))
            .map(|(_, policy)| policy)
    }

    /// Policy by endpoint name
    pub fn endpoint(&self, name: &str) -> Option<&Arc<EndpointPolicy>> {
        self.routes
            .iter()
            .map(|(_, policy)| policy)
            .find(|policy| policy.name == name)
    }

    pub fn policies(&self) -> impl Iterator<Item = &Arc<EndpointPolicy>> {
        self.routes.iter().map(|(_, policy)| policy)
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}
