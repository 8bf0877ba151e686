//! Configuration management for Turnstile.
//!
//! Configuration is read from an optional YAML file and then overridden by
//! environment variables of the form `TURNSTILE__SECTION__FIELD`, e.g.
//! `TURNSTILE__ADMISSION__LIMIT=100`. Durations are human-readable strings
//! ("500ms", "1m", "1h 30m") and are validated once at startup by
//! [`TurnstileConfig::admission_settings`].

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::admission::FailurePolicy;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::Algorithm;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile gateway.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counting store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8082))
}

/// Which counting store implementation to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis-compatible server. Required for more than one gateway.
    #[default]
    Redis,
    /// Process-local store; limits are not shared between processes.
    Memory,
}

/// Counting store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store implementation
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL for the redis backend
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Deadline for each limiter call against the store
    #[serde(default = "default_store_timeout")]
    pub timeout: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_store_url(),
            timeout: default_store_timeout(),
        }
    }
}

fn default_store_url() -> String {
    "redis://redis:6379".to_string()
}

fn default_store_timeout() -> String {
    "100ms".to_string()
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Rate limiting algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Requests allowed per window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length
    #[serde(default = "default_window")]
    pub window: String,

    /// Simultaneous in-flight requests allowed per client
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u64,

    /// Safety-net expiry of lease counters; must exceed the longest request
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl: String,

    /// What to do when the store cannot be consulted
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Run the sliding window as one atomic store operation
    #[serde(default)]
    pub sliding_window_atomic: bool,

    /// Prefix for every store key
    #[serde(default)]
    pub key_prefix: String,

    /// Derive client keys from X-Forwarded-For / X-Real-IP
    #[serde(default)]
    pub trust_forwarded_headers: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            limit: default_limit(),
            window: default_window(),
            max_concurrent: default_max_concurrent(),
            lease_ttl: default_lease_ttl(),
            failure_policy: FailurePolicy::default(),
            sliding_window_atomic: false,
            key_prefix: String::new(),
            trust_forwarded_headers: false,
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_window() -> String {
    "1m".to_string()
}

fn default_max_concurrent() -> u64 {
    10
}

fn default_lease_ttl() -> String {
    "30s".to_string()
}

/// Validated, typed admission settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub algorithm: Algorithm,
    pub limit: u64,
    pub window: Duration,
    pub max_concurrent: u64,
    pub lease_ttl: Duration,
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
    pub sliding_window_atomic: bool,
    pub key_prefix: String,
    pub trust_forwarded_headers: bool,
}

impl TurnstileConfig {
    /// Load configuration from a file path, applying environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Load configuration from an optional file, applying environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<TurnstileConfig>())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Validate the admission section and resolve durations.
    pub fn admission_settings(&self) -> Result<AdmissionSettings> {
        let admission = &self.admission;

        if admission.limit == 0 {
            return Err(TurnstileError::Config(
                "admission.limit must be a positive integer".to_string(),
            ));
        }
        if admission.max_concurrent == 0 {
            return Err(TurnstileError::Config(
                "admission.max_concurrent must be a positive integer".to_string(),
            ));
        }
        for (field, value) in [
            ("admission.limit", admission.limit),
            ("admission.max_concurrent", admission.max_concurrent),
        ] {
            if i64::try_from(value).is_err() {
                return Err(TurnstileError::Config(format!(
                    "{} must not exceed {}",
                    field,
                    i64::MAX
                )));
            }
        }

        Ok(AdmissionSettings {
            algorithm: admission.algorithm,
            limit: admission.limit,
            window: parse_duration("admission.window", &admission.window)?,
            max_concurrent: admission.max_concurrent,
            lease_ttl: parse_duration("admission.lease_ttl", &admission.lease_ttl)?,
            store_timeout: parse_duration("store.timeout", &self.store.timeout)?,
            failure_policy: admission.failure_policy,
            sliding_window_atomic: admission.sliding_window_atomic,
            key_prefix: admission.key_prefix.clone(),
            trust_forwarded_headers: admission.trust_forwarded_headers,
        })
    }
}

/// Parse a positive human-readable duration.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(value.trim()).map_err(|e| {
        TurnstileError::Config(format!("invalid duration for {}: {:?}: {}", field, value, e))
    })?;

    if duration.is_zero() {
        return Err(TurnstileError::Config(format!(
            "{} must be greater than zero",
            field
        )));
    }

    Ok(duration)
}
