//! Configuration management for Turnstile.
//!
//! Every field has a default, so an empty file (or none at all) yields a
//! working configuration. Values are layered: built-in defaults, then the
//! optional file, then `TURNSTILE__`-prefixed environment variables
//! (`TURNSTILE__STORE__REDIS_URL`, `TURNSTILE__LOGGING__JSON`, ...).

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::abuse::AbuseThresholds;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::DEFAULT_POLICY;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limit policies
    #[serde(default)]
    pub policies: PoliciesConfig,

    /// Abuse heuristic thresholds
    #[serde(default)]
    pub abuse: AbuseThresholds,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which counter store backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis instance
    #[default]
    Redis,
    /// Process-local memory; limits are not shared between instances
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every key written to the store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Deadline for a single store operation in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Run admissions as a single server-side script
    #[serde(default)]
    pub atomic: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            namespace: default_namespace(),
            timeout_ms: default_timeout_ms(),
            atomic: false,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_namespace() -> String {
    "turnstile".to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

/// Rate limit policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoliciesConfig {
    /// Policy for endpoint classes with no entry of their own
    #[serde(default = "default_policy")]
    pub default: String,

    /// Start from the platform's built-in endpoint classes
    #[serde(default = "default_builtin")]
    pub builtin: bool,

    /// `endpoint_class: "<count>/<period>"` entries
    #[serde(default)]
    pub classes: BTreeMap<String, String>,

    /// Endpoint classes that deny rather than allow when the store fails
    #[serde(default)]
    pub fail_closed: Vec<String>,
}

impl Default for PoliciesConfig {
    fn default() -> Self {
        Self {
            default: default_policy(),
            builtin: default_builtin(),
            classes: BTreeMap::new(),
            fail_closed: Vec::new(),
        }
    }
}

fn default_policy() -> String {
    DEFAULT_POLICY.to_string()
}

fn default_builtin() -> bool {
    true
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            if !path.exists() {
                return Err(TurnstileError::Config(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }
}
