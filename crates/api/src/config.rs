//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// A configuration variable holds a value we cannot use.
#[derive(Debug, Error)]
#[error("Invalid value '{value}' for {variable}: expected {expected}")]
pub struct ConfigError {
    pub variable: &'static str,
    pub value: String,
    pub expected: &'static str,
}

/// Log line format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError {
                variable: "LOG_FORMAT",
                value: s.to_string(),
                expected: "pretty or json",
            }),
        }
    }
}

/// Which Concurrency Router backend serializes per-trial mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouterBackend {
    /// One actor per key inside this process.
    #[default]
    Actor,
    /// Leases in the shared journal; serializes across instances.
    Lease,
}

impl FromStr for RouterBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "actor" => Ok(RouterBackend::Actor),
            "lease" => Ok(RouterBackend::Lease),
            _ => Err(ConfigError {
                variable: "ROUTER_BACKEND",
                value: s.to_string(),
                expected: "actor or lease",
            }),
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `pretty` or `json` (default: `pretty`)
/// - `DATABASE_URL`: PostgreSQL URL; in-memory stores are used when unset
/// - `ROUTER_BACKEND`: `actor` or `lease` (default: `actor`)
/// - `LEASE_TTL_SECS`: lease lifetime for the lease router (default: `30`)
/// - `ROUTER_ACQUIRE_TIMEOUT_SECS`: wait for a busy key (default: `10`)
/// - `RESUME_WORKFLOWS_ON_STARTUP`: re-drive running workflows (default: `true`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub router_backend: RouterBackend,
    pub lease_ttl: Duration,
    pub router_acquire_timeout: Duration,
    pub resume_workflows_on_startup: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to
    /// defaults. Unparseable numbers fall back too; an unknown log format
    /// or router backend is an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |name: &str, default: Duration| {
            lookup(name)
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: lookup("PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            router_backend: lookup("ROUTER_BACKEND")
                .map(|v| v.parse())
                .transpose()?
                .unwrap_or_default(),
            lease_ttl: secs("LEASE_TTL_SECS", defaults.lease_ttl),
            router_acquire_timeout: secs(
                "ROUTER_ACQUIRE_TIMEOUT_SECS",
                defaults.router_acquire_timeout,
            ),
            resume_workflows_on_startup: lookup("RESUME_WORKFLOWS_ON_STARTUP")
                .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or(defaults.resume_workflows_on_startup),
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            router_backend: RouterBackend::Actor,
            lease_ttl: Duration::from_secs(30),
            router_acquire_timeout: Duration::from_secs(10),
            resume_workflows_on_startup: true,
        }
    }
}
