//! Server configuration and CLI argument parsing
//!
//! Every option can be given as a CLI argument or as an environment variable
//! with the `TURNSTILE_` prefix. Precedence:
//!
//! 1. CLI arguments (highest priority)
//! 2. Environment variables
//! 3. Default values (lowest priority)
//!
//! The endpoint policy table comes from the TOML file named by
//! `--policy-file`, or the built-in table when none is given.
//!
//! # Example Usage
//!
//! ```bash
//! turnstile-server --upstream-url http://127.0.0.1:3000 --store redis
//!
//! export TURNSTILE_ENVIRONMENT=production
//! export TURNSTILE_TRUSTED_PROXIES=10.0.0.0/8
//! turnstile-server --http-port 9090
//! ```

use crate::policy::PolicyTable;
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use turnstile::{
    AdmissionSettings, CircuitBreakerConfig, DedupConfig, Environment, LimitSpec, TrustedProxies,
};

/// Fully resolved server configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub http: HttpConfig,
    pub upstream: UpstreamConfig,
    pub store: StoreConfig,
    /// Fleet size the local fallback divides limits by
    pub instances: u32,
    pub trusted_proxies: TrustedProxies,
    pub admission: AdmissionSettings,
    pub store_breaker: CircuitBreakerConfig,
    pub model_breaker: CircuitBreakerConfig,
    pub dedup: DedupConfig,
    /// Cookie carrying the session id
    pub session_cookie: String,
    /// Bearer token for `/admin` routes; the routes are not mounted without one
    pub admin_token: Option<String>,
    pub policies: PolicyTable,
    /// Logging level (error, warn, info, debug, trace)
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub host: String,
    pub port: u16,
}

/// The chat application requests are forwarded to
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Bound on connecting, including the first `PING`
    pub connect_timeout: Duration,
    /// Bound on each command; a silent server counts as unavailable
    pub response_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    /// In-process store, single instance only
    Memory,
    /// Shared Redis store
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            _ => Err(anyhow!(
                "Invalid store backend: {}. Valid options are: memory, redis",
                s
            )),
        }
    }
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(
    name = "turnstile-server",
    about = "Admission-control gateway for a metered chat backend",
    long_about = "Admission-control gateway for a metered chat backend.\n\nEnvironment variables with TURNSTILE_ prefix are supported. CLI arguments take precedence over environment variables."
)]
pub struct Args {
    // HTTP listener
    #[arg(
        long,
        value_name = "HOST",
        help = "HTTP host",
        default_value = "127.0.0.1",
        env = "TURNSTILE_HTTP_HOST"
    )]
    pub http_host: String,
    #[arg(
        long,
        value_name = "PORT",
        help = "HTTP port",
        default_value_t = 8080,
        env = "TURNSTILE_HTTP_PORT"
    )]
    pub http_port: u16,

    // Upstream
    #[arg(
        long,
        value_name = "URL",
        help = "Base URL of the chat application",
        default_value = "http://127.0.0.1:3000",
        env = "TURNSTILE_UPSTREAM_URL"
    )]
    pub upstream_url: String,
    #[arg(
        long,
        value_name = "SECS",
        help = "Upstream request timeout (seconds)",
        default_value_t = 60,
        env = "TURNSTILE_UPSTREAM_TIMEOUT"
    )]
    pub upstream_timeout: u64,

    // Store
    #[arg(
        long,
        value_name = "BACKEND",
        help = "Store backend: memory, redis",
        default_value = "memory",
        env = "TURNSTILE_STORE"
    )]
    pub store: StoreBackend,
    #[arg(
        long,
        value_name = "URL",
        help = "Redis URL",
        default_value = "redis://127.0.0.1:6379",
        env = "TURNSTILE_REDIS_URL"
    )]
    pub redis_url: String,
    #[arg(
        long,
        value_name = "MS",
        help = "Redis connect timeout (milliseconds)",
        default_value_t = 2000,
        env = "TURNSTILE_REDIS_CONNECT_TIMEOUT_MS"
    )]
    pub redis_connect_timeout_ms: u64,
    #[arg(
        long,
        value_name = "MS",
        help = "Redis per-command response timeout (milliseconds)",
        default_value_t = 500,
        env = "TURNSTILE_REDIS_RESPONSE_TIMEOUT_MS"
    )]
    pub redis_response_timeout_ms: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Number of gateway instances sharing the store",
        default_value_t = 1,
        env = "TURNSTILE_INSTANCES"
    )]
    pub instances: u32,

    // Identity
    #[arg(
        long,
        value_name = "LIST",
        help = "Comma-separated trusted proxy addresses or CIDR ranges",
        default_value = "",
        env = "TURNSTILE_TRUSTED_PROXIES"
    )]
    pub trusted_proxies: String,
    #[arg(
        long,
        value_name = "NAME",
        help = "Session cookie name",
        default_value = "session_id",
        env = "TURNSTILE_SESSION_COOKIE"
    )]
    pub session_cookie: String,

    // Limits
    #[arg(
        long,
        value_name = "ENV",
        help = "Deployment environment: development, production",
        default_value = "development",
        env = "TURNSTILE_ENVIRONMENT"
    )]
    pub environment: Environment,
    #[arg(
        long,
        help = "Disable rate limiting (ignored in production)",
        env = "TURNSTILE_DISABLE_RATE_LIMITING"
    )]
    pub disable_rate_limiting: bool,
    #[arg(
        long,
        value_name = "N",
        help = "Requests per window per client address",
        default_value_t = 60,
        env = "TURNSTILE_IP_LIMIT"
    )]
    pub ip_limit: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "Client address window (seconds)",
        default_value_t = 60,
        env = "TURNSTILE_IP_WINDOW"
    )]
    pub ip_window: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Requests per window per user",
        default_value_t = 60,
        env = "TURNSTILE_USER_LIMIT"
    )]
    pub user_limit: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "User window (seconds)",
        default_value_t = 60,
        env = "TURNSTILE_USER_WINDOW"
    )]
    pub user_window: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Metered requests per window per identifier",
        default_value_t = 1000,
        env = "TURNSTILE_GLOBAL_LIMIT"
    )]
    pub global_limit: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "Metered quota window (seconds)",
        default_value_t = 86_400,
        env = "TURNSTILE_GLOBAL_WINDOW"
    )]
    pub global_window: u64,

    // Breakers
    #[arg(
        long,
        value_name = "N",
        help = "Store failures before its circuit opens",
        default_value_t = 5,
        env = "TURNSTILE_STORE_FAILURE_THRESHOLD"
    )]
    pub store_failure_threshold: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "Store circuit cooldown (seconds)",
        default_value_t = 30,
        env = "TURNSTILE_STORE_OPEN_TIMEOUT"
    )]
    pub store_open_timeout: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Model API failures before its circuit opens",
        default_value_t = 5,
        env = "TURNSTILE_MODEL_FAILURE_THRESHOLD"
    )]
    pub model_failure_threshold: u32,
    #[arg(
        long,
        value_name = "SECS",
        help = "Model API circuit cooldown (seconds)",
        default_value_t = 60,
        env = "TURNSTILE_MODEL_OPEN_TIMEOUT"
    )]
    pub model_open_timeout: u64,
    #[arg(
        long,
        value_name = "N",
        help = "Trial successes that close a half-open circuit",
        default_value_t = 2,
        env = "TURNSTILE_SUCCESS_THRESHOLD"
    )]
    pub success_threshold: u32,

    // Deduplication
    #[arg(
        long,
        value_name = "SECS",
        help = "Deduplication lock lifetime (seconds)",
        default_value_t = 30,
        env = "TURNSTILE_DEDUP_TTL"
    )]
    pub dedup_ttl: u64,
    #[arg(
        long,
        value_name = "LIST",
        help = "Comma-separated request headers mixed into the dedup digest",
        default_value = "authorization,cookie",
        env = "TURNSTILE_DEDUP_HEADERS"
    )]
    pub dedup_headers: String,

    // Administration
    #[arg(
        long,
        value_name = "TOKEN",
        help = "Bearer token for the admin routes (disabled when unset)",
        env = "TURNSTILE_ADMIN_TOKEN"
    )]
    pub admin_token: Option<String>,
    #[arg(
        long,
        value_name = "PATH",
        help = "Endpoint policy TOML file",
        env = "TURNSTILE_POLICY_FILE"
    )]
    pub policy_file: Option<PathBuf>,

    #[arg(
        long,
        value_name = "LEVEL",
        help = "Log level: error, warn, info, debug, trace",
        default_value = "info",
        env = "TURNSTILE_LOG_LEVEL"
    )]
    pub log_level: String,

    // Utility options
    #[arg(
        long,
        help = "List all environment variables and exit",
        action = clap::ArgAction::SetTrue
    )]
    pub list_env_vars: bool,
}

impl Config {
    /// Build configuration from environment variables and CLI arguments
    ///
    /// # Errors
    ///
    /// Returns an error if the policy file cannot be loaded, the trusted
    /// proxy list does not parse, or validation fails.
    pub fn from_env_and_args() -> Result<Self> {
        let args = Args::parse();

        if args.list_env_vars {
            Self::print_env_vars();
            std::process::exit(0);
        }

        Self::from_args(args)
    }

    pub fn from_args(args: Args) -> Result<Self> {
        let trusted_proxies = TrustedProxies::parse_list(&args.trusted_proxies)
            .context("invalid TURNSTILE_TRUSTED_PROXIES")?;

        let policies = match &args.policy_file {
            Some(path) => PolicyTable::load(path)?,
            None => PolicyTable::builtin(),
        };

        let config = Config {
            http: HttpConfig {
                host: args.http_host,
                port: args.http_port,
            },
            upstream: UpstreamConfig {
                base_url: args.upstream_url.trim_end_matches('/').to_string(),
                timeout: Duration::from_secs(args.upstream_timeout),
            },
            store: StoreConfig {
                backend: args.store,
                redis_url: args.redis_url,
                connect_timeout: Duration::from_millis(args.redis_connect_timeout_ms),
                response_timeout: Duration::from_millis(args.redis_response_timeout_ms),
            },
            instances: args.instances,
            trusted_proxies,
            admission: AdmissionSettings {
                environment: args.environment,
                disable_rate_limiting: args.disable_rate_limiting,
                ip_limit: LimitSpec::new(args.ip_limit, Duration::from_secs(args.ip_window)),
                user_limit: LimitSpec::new(args.user_limit, Duration::from_secs(args.user_window)),
                global_limit: LimitSpec::new(
                    args.global_limit,
                    Duration::from_secs(args.global_window),
                ),
            },
            store_breaker: CircuitBreakerConfig {
                failure_threshold: args.store_failure_threshold,
                success_threshold: args.success_threshold,
                open_timeout: Duration::from_secs(args.store_open_timeout),
            },
            model_breaker: CircuitBreakerConfig {
                failure_threshold: args.model_failure_threshold,
                success_threshold: args.success_threshold,
                open_timeout: Duration::from_secs(args.model_open_timeout),
            },
            dedup: DedupConfig {
                ttl: Duration::from_secs(args.dedup_ttl),
                header_names: header_list(&args.dedup_headers),
                ..DedupConfig::default()
            },
            session_cookie: args.session_cookie,
            admin_token: args.admin_token.filter(|token| !token.is_empty()),
            policies,
            log_level: args.log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error for a zero instance count, zero limits or windows,
    /// zero breaker thresholds, a zero dedup TTL, or an empty policy table.
    pub fn validate(&self) -> Result<()> {
        if self.instances == 0 {
            return Err(anyhow!("instance count must be at least 1"));
        }

        self.admission.validate()?;

        for (name, breaker) in [("store", &self.store_breaker), ("model", &self.model_breaker)] {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(anyhow!("{name} breaker thresholds must be at least 1"));
            }
        }

        if self.dedup.ttl.is_zero() {
            return Err(anyhow!("dedup TTL must be above zero"));
        }

        if self.store.connect_timeout.is_zero() || self.store.response_timeout.is_zero() {
            return Err(anyhow!("redis timeouts must be above zero"));
        }

        if self.policies.is_empty() {
            return Err(anyhow!(
                "the endpoint policy table is empty.\n\n\
                Define at least one [[endpoints]] entry in the policy file, or\n\
                omit --policy-file to use the built-in table."
            ));
        }

        if self.store.backend == StoreBackend::Memory && self.instances > 1 {
            tracing::warn!(
                instances = self.instances,
                "memory store is not shared between instances"
            );
        }

        Ok(())
    }

    fn print_env_vars() {
        println!("Turnstile Environment Variables");
        println!("===============================");
        println!();
        println!("All environment variables use the TURNSTILE_ prefix.");
        println!("CLI arguments take precedence over environment variables.");
        println!();

        println!("Listener and Upstream:");
        println!("  TURNSTILE_HTTP_HOST=<host>               HTTP host [default: 127.0.0.1]");
        println!("  TURNSTILE_HTTP_PORT=<port>               HTTP port [default: 8080]");
        println!(
            "  TURNSTILE_UPSTREAM_URL=<url>             Chat application [default: http://127.0.0.1:3000]"
        );
        println!("  TURNSTILE_UPSTREAM_TIMEOUT=<secs>        Upstream timeout [default: 60]");
        println!();

        println!("Store:");
        println!("  TURNSTILE_STORE=<backend>                memory, redis [default: memory]");
        println!(
            "  TURNSTILE_REDIS_URL=<url>                Redis URL [default: redis://127.0.0.1:6379]"
        );
        println!("  TURNSTILE_REDIS_CONNECT_TIMEOUT_MS=<ms>  Connect timeout [default: 2000]");
        println!("  TURNSTILE_REDIS_RESPONSE_TIMEOUT_MS=<ms> Command timeout [default: 500]");
        println!("  TURNSTILE_INSTANCES=<n>                  Gateway instances [default: 1]");
        println!();

        println!("Identity:");
        println!("  TURNSTILE_TRUSTED_PROXIES=<list>         Addresses or CIDR ranges [default: none]");
        println!("  TURNSTILE_SESSION_COOKIE=<name>          Session cookie [default: session_id]");
        println!();

        println!("Limits:");
        println!(
            "  TURNSTILE_ENVIRONMENT=<env>              development, production [default: development]"
        );
        println!(
            "  TURNSTILE_DISABLE_RATE_LIMITING=true     Skip limiters (ignored in production)"
        );
        println!("  TURNSTILE_IP_LIMIT=<n>                   Per address [default: 60]");
        println!("  TURNSTILE_IP_WINDOW=<secs>               [default: 60]");
        println!("  TURNSTILE_USER_LIMIT=<n>                 Per user [default: 60]");
        println!("  TURNSTILE_USER_WINDOW=<secs>             [default: 60]");
        println!("  TURNSTILE_GLOBAL_LIMIT=<n>               Metered quota [default: 1000]");
        println!("  TURNSTILE_GLOBAL_WINDOW=<secs>           [default: 86400]");
        println!();

        println!("Circuit Breakers:");
        println!("  TURNSTILE_STORE_FAILURE_THRESHOLD=<n>    [default: 5]");
        println!("  TURNSTILE_STORE_OPEN_TIMEOUT=<secs>      [default: 30]");
        println!("  TURNSTILE_MODEL_FAILURE_THRESHOLD=<n>    [default: 5]");
        println!("  TURNSTILE_MODEL_OPEN_TIMEOUT=<secs>      [default: 60]");
        println!("  TURNSTILE_SUCCESS_THRESHOLD=<n>          [default: 2]");
        println!();

        println!("General:");
        println!("  TURNSTILE_DEDUP_TTL=<secs>               Dedup lock lifetime [default: 30]");
        println!(
            "  TURNSTILE_DEDUP_HEADERS=<list>           Digest headers [default: authorization,cookie]"
        );
        println!("  TURNSTILE_ADMIN_TOKEN=<token>            Enables /admin routes");
        println!("  TURNSTILE_POLICY_FILE=<path>             Endpoint policy TOML");
        println!(
            "  TURNSTILE_LOG_LEVEL=<level>              error, warn, info, debug, trace [default: info]"
        );
        println!();

        println!("Examples:");
        println!("  export TURNSTILE_STORE=redis");
        println!("  export TURNSTILE_INSTANCES=4");
        println!("  turnstile-server --http-port 9090");
    }
}

/// Lowercased, trimmed, non-empty header names from a comma-separated list
fn header_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["turnstile-server"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_store_backend_from_str() {
        assert_eq!(StoreBackend::from_str("memory").unwrap(), StoreBackend::Memory);
        assert_eq!(StoreBackend::from_str("REDIS").unwrap(), StoreBackend::Redis);
        assert!(StoreBackend::from_str("memcached").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(args(&[])).unwrap();

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.instances, 1);
        assert!(config.trusted_proxies.is_empty());
        assert_eq!(config.admission, AdmissionSettings::default());
        assert_eq!(config.dedup.ttl, Duration::from_secs(30));
        assert_eq!(config.dedup.header_names, vec!["authorization", "cookie"]);
        assert_eq!(config.store.response_timeout, Duration::from_millis(500));
        assert!(config.admin_token.is_none());
        assert!(!config.policies.is_empty());
    }

    #[test]
    fn test_cli_values() {
        let config = Config::from_args(args(&[
            "--upstream-url",
            "http://chat:3000/",
            "--instances",
            "4",
            "--trusted-proxies",
            "10.0.0.0/8, 192.168.1.1",
            "--environment",
            "production",
            "--ip-limit",
            "10",
            "--admin-token",
            "secret",
        ]))
        .unwrap();

        assert_eq!(config.upstream.base_url, "http://chat:3000");
        assert_eq!(config.instances, 4);
        assert!(config.trusted_proxies.is_trusted("10.1.2.3".parse().unwrap()));
        assert!(config.admission.environment.is_production());
        assert_eq!(config.admission.ip_limit, LimitSpec::per_minute(10));
        assert_eq!(config.admin_token.as_deref(), Some("secret"));
    }

    #[test]
    fn test_validation_rejects_zero_instances() {
        assert!(Config::from_args(args(&["--instances", "0"])).is_err());
    }

    #[test]
    fn test_validation_rejects_zero_limits() {
        assert!(Config::from_args(args(&["--global-limit", "0"])).is_err());
        assert!(Config::from_args(args(&["--user-window", "0"])).is_err());
        assert!(Config::from_args(args(&["--store-failure-threshold", "0"])).is_err());
    }

    #[test]
    fn test_validation_rejects_empty_policy_table() {
        let mut config = Config::from_args(args(&[])).unwrap();
        config.policies = PolicyTable::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dedup_headers_and_redis_timeouts() {
        let config = Config::from_args(args(&[
            "--dedup-headers",
            " Authorization, X-Tenant ,,",
            "--redis-connect-timeout-ms",
            "750",
        ]))
        .unwrap();
        assert_eq!(config.dedup.header_names, vec!["authorization", "x-tenant"]);
        assert_eq!(config.store.connect_timeout, Duration::from_millis(750));

        assert!(Config::from_args(args(&["--redis-response-timeout-ms", "0"])).is_err());
    }

    #[test]
    fn test_invalid_proxy_list() {
        assert!(Config::from_args(args(&["--trusted-proxies", "not-an-ip"])).is_err());
    }

    #[test]
    fn test_empty_admin_token_disables_admin() {
        let config = Config::from_args(args(&["--admin-token", ""])).unwrap();
        assert!(config.admin_token.is_none());
    }
}
