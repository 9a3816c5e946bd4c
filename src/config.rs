//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__LIMITER__CAPACITY=20`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for a Tollgate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Bucket parameters and failure policy
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,
}

/// What a limiter answers when the shared store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Admit the request (availability over strict enforcement).
    #[default]
    Allow,
    /// Reject the request.
    Deny,
}

/// Bucket parameters, fixed per limiter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum tokens a bucket can hold
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Minimum idle lifetime of a key's state. Only extends the derived TTL.
    #[serde(default)]
    pub key_ttl_ms: Option<u64>,

    /// Verdict to return when the shared store fails
    #[serde(default)]
    pub fallback_on_store_error: FallbackPolicy,

    /// Try a process-local bucket before contacting the shared store
    #[serde(default = "default_true")]
    pub local_fast_path: bool,

    /// Ship tokens admitted on the fast path to the shared store on the next round-trip
    #[serde(default = "default_true")]
    pub settle_local_admissions: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            key_ttl_ms: None,
            fallback_on_store_error: FallbackPolicy::default(),
            local_fast_path: true,
            settle_local_admissions: true,
        }
    }
}

fn default_capacity() -> f64 {
    10.0
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

/// Shared store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `redis://` / `rediss://` URL, `memory://` for an in-process store, or none
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Upper bound on a single shared-store call
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix prepended to every rate-limit key in the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    "rl:".to_string()
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load layered configuration: an optional file, then `TOLLGATE__*` environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading limiter configuration");
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: TollgateConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        let limiter = &self.limiter;
        if !limiter.capacity.is_finite() || limiter.capacity <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "capacity must be a positive number, got {}",
                limiter.capacity
            )));
        }
        if !limiter.refill_rate.is_finite() || limiter.refill_rate <= 0.0 {
            return Err(TollgateError::InvalidConfiguration(format!(
                "refill_rate must be a positive number, got {}",
                limiter.refill_rate
            )));
        }
        if self.store.timeout_ms == 0 {
            return Err(TollgateError::InvalidConfiguration(
                "store timeout_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
