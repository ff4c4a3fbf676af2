//! Service configuration parsed from environment variables.
//!
//! DESIGN
//! ======
//! All knobs come from `TOLLGATE_*` environment variables and are parsed
//! into one immutable `Config` snapshot at startup. Fatal misconfiguration
//! (no backends, bad port, bad durations) fails `from_env`; recoverable
//! oddities (unknown policy, non-positive defaults, timeout >= interval)
//! are warned about and replaced with safe values.

use std::time::Duration;

use crate::pool::Policy;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_RATE: f64 = 1.0;
pub const DEFAULT_CAPACITY: f64 = 1.0;
pub const DEFAULT_HEALTH_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_HEALTH_PATH: &str = "/healthz";
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 10_000;

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("TOLLGATE_BACKENDS is required and must list at least one backend URL")]
    MissingBackends,
    #[error("invalid TOLLGATE_PORT '{0}'")]
    InvalidPort(String),
    #[error("invalid {var} '{value}': expected a positive integer of milliseconds")]
    InvalidDuration { var: &'static str, value: String },
}

// =============================================================================
// CONFIG
// =============================================================================

/// Per-client rate limiter settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Tokens added per second when no per-client record exists.
    pub default_rate: f64,
    /// Bucket capacity when no per-client record exists.
    pub default_capacity: f64,
    /// Header naming the rate-limit subject. Empty means IP-only.
    pub identifier_header: String,
    /// SQLite file path. Empty means no persistence (defaults-only limiter).
    pub db_path: String,
}

/// Background health prober settings.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Probe path, always `/`-prefixed.
    pub path: String,
}

/// Immutable configuration snapshot consumed by the whole service.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Ordered backend URLs. The order defines round-robin fairness.
    pub backends: Vec<String>,
    pub policy: Policy,
    pub rate_limit: RateLimitConfig,
    pub health: HealthCheckConfig,
    pub shutdown_grace: Duration,
}

impl Config {
    /// Build the configuration snapshot from `TOLLGATE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend list is empty or a numeric value
    /// cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port(std::env::var("TOLLGATE_PORT").ok().as_deref())?;
        let backends = parse_backends(std::env::var("TOLLGATE_BACKENDS").ok().as_deref())?;
        let policy = parse_policy(std::env::var("TOLLGATE_POLICY").ok().as_deref());

        let rate_limit = RateLimitConfig {
            enabled: env_flag("TOLLGATE_RATE_LIMIT_ENABLED"),
            default_rate: parse_positive_f64("TOLLGATE_DEFAULT_RATE", DEFAULT_RATE),
            default_capacity: parse_positive_f64("TOLLGATE_DEFAULT_CAPACITY", DEFAULT_CAPACITY),
            identifier_header: std::env::var("TOLLGATE_IDENTIFIER_HEADER").unwrap_or_default(),
            db_path: std::env::var("TOLLGATE_DB_PATH").unwrap_or_default(),
        };

        let health = parse_health(
            env_flag("TOLLGATE_HEALTH_ENABLED"),
            std::env::var("TOLLGATE_HEALTH_INTERVAL_MS").ok().as_deref(),
            std::env::var("TOLLGATE_HEALTH_TIMEOUT_MS").ok().as_deref(),
            std::env::var("TOLLGATE_HEALTH_PATH").ok().as_deref(),
        )?;

        let grace_ms = parse_duration_ms(
            "TOLLGATE_SHUTDOWN_GRACE_MS",
            std::env::var("TOLLGATE_SHUTDOWN_GRACE_MS").ok().as_deref(),
            DEFAULT_SHUTDOWN_GRACE_MS,
        )?;

        Ok(Self {
            port,
            backends,
            policy,
            rate_limit,
            health,
            shutdown_grace: Duration::from_millis(grace_ms),
        })
    }
}

// =============================================================================
// PARSERS
// =============================================================================

fn parse_port(raw: Option<&str>) -> Result<u16, ConfigError> {
    match raw {
        None | Some("") => Ok(DEFAULT_PORT),
        Some(v) => v.parse::<u16>().map_err(|_| ConfigError::InvalidPort(v.to_string())),
    }
}

fn parse_backends(raw: Option<&str>) -> Result<Vec<String>, ConfigError> {
    let raw = raw.unwrap_or_default();
    let backends: Vec<String> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();
    if backends.is_empty() {
        return Err(ConfigError::MissingBackends);
    }
    Ok(backends)
}

/// Parse the balancing policy, falling back to round-robin on anything
/// unrecognized.
fn parse_policy(raw: Option<&str>) -> Policy {
    let raw = raw.unwrap_or("round_robin");
    match Policy::parse(raw) {
        Some(policy) => policy,
        None => {
            tracing::warn!(policy = raw, "unknown balancing policy; using round_robin");
            Policy::RoundRobin
        }
    }
}

/// Parse a rate/capacity default, replacing non-positive or malformed
/// values with the built-in default.
fn parse_positive_f64(var: &str, default: f64) -> f64 {
    let Some(raw) = std::env::var(var).ok().filter(|v| !v.is_empty()) else {
        return default;
    };
    match raw.parse::<f64>() {
        Ok(v) if v > 0.0 => v,
        _ => {
            tracing::warn!(var, value = %raw, default, "value must be a positive number; using default");
            default
        }
    }
}

fn parse_health(
    enabled: bool,
    interval_raw: Option<&str>,
    timeout_raw: Option<&str>,
    path_raw: Option<&str>,
) -> Result<HealthCheckConfig, ConfigError> {
    let interval_ms =
        parse_duration_ms("TOLLGATE_HEALTH_INTERVAL_MS", interval_raw, DEFAULT_HEALTH_INTERVAL_MS)?;
    let timeout_ms =
        parse_duration_ms("TOLLGATE_HEALTH_TIMEOUT_MS", timeout_raw, DEFAULT_HEALTH_TIMEOUT_MS)?;

    if enabled && timeout_ms >= interval_ms {
        tracing::warn!(
            timeout_ms,
            interval_ms,
            "health probe timeout should be shorter than the interval"
        );
    }

    Ok(HealthCheckConfig {
        enabled,
        interval: Duration::from_millis(interval_ms),
        timeout: Duration::from_millis(timeout_ms),
        path: normalize_health_path(path_raw),
    })
}

/// Positive milliseconds or the default. Zero is rejected: a zero interval
/// would spin the prober and a zero timeout fails every probe.
fn parse_duration_ms(var: &'static str, raw: Option<&str>, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None | Some("") => Ok(default),
        Some(v) => match v.parse::<u64>() {
            Ok(ms) if ms > 0 => Ok(ms),
            _ => Err(ConfigError::InvalidDuration { var, value: v.to_string() }),
        },
    }
}

fn normalize_health_path(raw: Option<&str>) -> String {
    let path = raw.unwrap_or(DEFAULT_HEALTH_PATH);
    if path.is_empty() {
        return DEFAULT_HEALTH_PATH.to_string();
    }
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

fn env_flag(var: &str) -> bool {
    matches!(
        std::env::var(var).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
