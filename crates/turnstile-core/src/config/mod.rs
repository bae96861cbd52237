//! Application configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: set on the builder below
//! 2. **Config file**: TOML file named by `TURNSTILE_CONFIG`
//! 3. **Environment variables**: `TURNSTILE__*` overrides, `__`-separated
//!    for nesting (e.g. `TURNSTILE__UPSTREAM__PRIMARY_URL=...`)
//!
//! Configuration is validated at load time; a proxy with a missing primary
//! upstream or TLS material refuses to start rather than limping along.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// HTTPS listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IP address to bind. Defaults to `0.0.0.0`.
    pub bind_address: String,
    /// Port to listen on. Defaults to `443`.
    pub bind_port: u16,
    /// Path to the PEM-encoded TLS certificate chain. Required.
    pub tls_cert_path: String,
    /// Path to the PEM-encoded TLS private key. Required.
    pub tls_key_path: String,
    /// Concurrency cap on the public router. Defaults to `1024`.
    pub max_concurrent_requests: usize,
    /// Request body size cap in bytes. Defaults to 2 MiB.
    pub body_limit_bytes: usize,
}

/// Upstream endpoints and failover policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Primary RPC node URL. Required.
    pub primary_url: String,
    /// Optional fallback node; without one the breaker never opens.
    #[serde(default)]
    pub fallback_url: Option<String>,
    /// Bound on primary POSTs, seconds. Defaults to `10`.
    pub request_timeout_seconds: u64,
    /// Bound on the fallback path, seconds. Defaults to `15`.
    pub fallback_timeout_seconds: u64,
    /// Consecutive failures before the breaker opens. Defaults to `2`.
    pub failure_threshold: u32,
    /// Seconds in `Open` before a half-open probe. Defaults to `60`.
    pub reset_timeout_seconds: u64,
    /// Tolerate a self-signed certificate on the fallback.
    #[serde(default)]
    pub insecure_fallback_tls: bool,
}

/// Rate-limit ceilings and refresh cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Hourly sliding-window ceiling for public origins.
    pub origin_hourly: i64,
    /// Hourly sliding-window ceiling per client IP.
    pub ip_hourly: i64,
    /// Daily cap for public origins.
    pub origin_daily: i64,
    /// Daily cap per client IP.
    pub ip_daily: i64,
    /// Limiter poll interval, seconds. Defaults to `10`.
    pub poll_interval_seconds: u64,
}

/// Accounting and reject-log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Aggregator flush interval, seconds. Defaults to `10`.
    pub flush_interval_seconds: u64,
    /// Origins excluded from all counters (health checkers, internal probes).
    #[serde(default)]
    pub synthetic_origins: Vec<String>,
    /// File the reject log appends to.
    pub reject_log_path: String,
}

/// Counter store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. Required.
    pub url: String,
    /// Connection pool bound. Defaults to `10`.
    pub max_connections: u32,
}

/// Admin API settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Key expected in `X-Admin-Key`. When unset every admin endpoint
    /// answers 403.
    #[serde(default)]
    pub api_key: Option<String>,
}

/// IP deny-list settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlacklistConfig {
    /// Newline-delimited deny-list file, hot-reloaded. Optional.
    #[serde(default)]
    pub file_path: Option<String>,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `pretty` or `json`. Defaults to `pretty`.
    pub format: String,
}

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub limits: LimitsConfig,
    pub telemetry: TelemetryConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub blacklist: BlacklistConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed, a required
    /// field is missing, or validation fails.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("server.bind_address", "0.0.0.0")?
            .set_default("server.bind_port", 443)?
            .set_default("server.tls_cert_path", "")?
            .set_default("server.tls_key_path", "")?
            .set_default("server.max_concurrent_requests", 1024)?
            .set_default("server.body_limit_bytes", 2 * 1024 * 1024)?
            .set_default("upstream.primary_url", "")?
            .set_default("upstream.request_timeout_seconds", 10)?
            .set_default("upstream.fallback_timeout_seconds", 15)?
            .set_default("upstream.failure_threshold", 2)?
            .set_default("upstream.reset_timeout_seconds", 60)?
            .set_default("limits.origin_hourly", 5000)?
            .set_default("limits.ip_hourly", 2000)?
            .set_default("limits.origin_daily", 50_000)?
            .set_default("limits.ip_daily", 20_000)?
            .set_default("limits.poll_interval_seconds", 10)?
            .set_default("telemetry.flush_interval_seconds", 10)?
            .set_default("telemetry.reject_log_path", "rejected.log")?
            .set_default("database.url", "")?
            .set_default("database.max_connections", 10)?
            .set_default("logging.format", "pretty")?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("TURNSTILE").separator("__"))
            .build()?;

        let config: AppConfig = builder.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `config/config.toml`, overridable via the
    /// `TURNSTILE_CONFIG` environment variable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("TURNSTILE_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Rejects configurations the proxy cannot run with.
    fn validate(&self) -> Result<(), ConfigError> {
        let fail = |message: String| Err(ConfigError::Message(message));

        if self.upstream.primary_url.is_empty() {
            return fail("upstream.primary_url is required".into());
        }
        if let Some(fallback) = &self.upstream.fallback_url {
            if fallback == &self.upstream.primary_url {
                return fail("upstream.fallback_url must differ from the primary".into());
            }
        }
        if self.server.tls_cert_path.is_empty() || self.server.tls_key_path.is_empty() {
            return fail("server.tls_cert_path and server.tls_key_path are required".into());
        }
        if self.database.url.is_empty() {
            return fail("database.url is required".into());
        }
        if self.limits.poll_interval_seconds == 0 ||
            self.telemetry.flush_interval_seconds == 0 ||
            self.upstream.request_timeout_seconds == 0
        {
            return fail("intervals and timeouts must be greater than zero".into());
        }
        if self.limits.origin_hourly <= 0 ||
            self.limits.ip_hourly <= 0 ||
            self.limits.origin_daily <= 0 ||
            self.limits.ip_daily <= 0
        {
            return fail("rate limits must be positive".into());
        }
        Ok(())
    }

    /// Listener socket address.
    ///
    /// # Errors
    ///
    /// Returns an error string when `server.bind_address` does not parse.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port)
            .parse()
            .map_err(|_| format!("invalid bind address {}", self.server.bind_address))
    }
}
