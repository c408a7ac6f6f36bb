//! Configuration management for Ratekeeper.
//!
//! Configuration is resolved once at startup: defaults, then an optional
//! YAML file, then environment variables, then validation.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use crate::error::{RateKeeperError, Result};

/// Main configuration for the Ratekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateKeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Path answered without rate limiting
    #[serde(default = "default_health_path")]
    pub health_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            health_path: default_health_path(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests allowed per window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Window length, e.g. "1 m" or "30s"
    #[serde(default = "default_window")]
    pub window: String,

    /// Allow everything without counting
    #[serde(default)]
    pub disabled: bool,

    /// REST endpoint of the distributed store
    #[serde(default)]
    pub redis_rest_url: Option<String>,

    /// Access token for the distributed store
    #[serde(default)]
    pub redis_rest_token: Option<String>,

    /// Namespace for counter keys in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Give up on a distributed check after this many milliseconds
    #[serde(default = "default_distributed_timeout_ms")]
    pub distributed_timeout_ms: u64,

    /// Limit in-process when no store credentials are configured
    #[serde(default)]
    pub local_fallback: bool,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window: default_window(),
            disabled: false,
            redis_rest_url: None,
            redis_rest_token: None,
            key_prefix: default_key_prefix(),
            distributed_timeout_ms: default_distributed_timeout_ms(),
            local_fallback: false,
        }
    }
}

fn default_max_requests() -> u32 {
    10
}

fn default_window() -> String {
    "1 m".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_distributed_timeout_ms() -> u64 {
    500
}

impl RateLimitingConfig {
    /// Store URL and token, only when both are present and non-empty.
    pub fn store_credentials(&self) -> Option<(&str, &str)> {
        let url = self.redis_rest_url.as_deref().filter(|s| !s.trim().is_empty())?;
        let token = self.redis_rest_token.as_deref().filter(|s| !s.trim().is_empty())?;
        Some((url, token))
    }
}

impl RateKeeperConfig {
    /// Load configuration: optional YAML file, environment overrides, validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RateKeeperError::Config(e.to_string()))
    }

    /// Override fields from environment variables.
    ///
    /// `lookup` returns the raw value of a variable; empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let limits = &mut self.rate_limiting;

        if let Some(value) = var("RATE_LIMIT_MAX_REQUESTS") {
            limits.max_requests = parse_value("RATE_LIMIT_MAX_REQUESTS", &value)?;
        }
        if let Some(value) = var("RATE_LIMIT_WINDOW") {
            limits.window = value;
        }
        if let Some(value) = var("DISABLE_RATE_LIMIT") {
            limits.disabled = parse_bool("DISABLE_RATE_LIMIT", &value)?;
        }
        if let Some(value) = var("UPSTASH_REDIS_REST_URL") {
            limits.redis_rest_url = Some(value);
        }
        if let Some(value) = var("UPSTASH_REDIS_REST_TOKEN") {
            limits.redis_rest_token = Some(value);
        }
        if let Some(value) = var("RATE_LIMIT_KEY_PREFIX") {
            limits.key_prefix = value;
        }
        if let Some(value) = var("RATE_LIMIT_TIMEOUT_MS") {
            limits.distributed_timeout_ms = parse_value("RATE_LIMIT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = var("RATE_LIMIT_LOCAL_FALLBACK") {
            limits.local_fallback = parse_bool("RATE_LIMIT_LOCAL_FALLBACK", &value)?;
        }
        if let Some(value) = var("RATEKEEPER_LISTEN_ADDR") {
            self.server.listen_addr = parse_value("RATEKEEPER_LISTEN_ADDR", &value)?;
        }
        if let Some(value) = var("RATEKEEPER_HEALTH_PATH") {
            self.server.health_path = value;
        }

        Ok(())
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.max_requests == 0 {
            return Err(RateKeeperError::Config(
                "max_requests must be a positive integer".to_string(),
            ));
        }
        if self.rate_limiting.distributed_timeout_ms == 0 {
            return Err(RateKeeperError::Config(
                "distributed_timeout_ms must be positive".to_string(),
            ));
        }
        if !self.server.health_path.starts_with('/') {
            return Err(RateKeeperError::Config(format!(
                "health_path must start with '/': {}",
                self.server.health_path
            )));
        }
        Ok(())
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| RateKeeperError::Config(format!("failed to parse {}='{}': {}", key, value, e)))
}

/// Treats "true"/"1" as true and "false"/"0" as false, case-insensitively.
fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(RateKeeperError::Config(format!(
            "invalid value for {}: expected true or false, got '{}'",
            key, value
        ))),
    }
}
