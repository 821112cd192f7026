// Configuration File Support
//
// TOML configuration for the coordinator with environment variable overrides.
// The file path comes from `--config`, then RATEKEEPER_CONFIG, then
// ./ratekeeper.toml. A missing file yields the defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::quota::QuotaLimits;
use crate::rate_limit::{
    LimiterSettings, OperationRegistry, RateLimitConfig, StoreFailurePolicy,
};
use crate::retry::RetryPolicy;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Shared token store
    pub store: StoreConfig,

    /// Queueing behaviour
    pub limiter: LimiterConfig,

    /// Per-operation limits; the built-in table is used when empty
    pub operations: Vec<RateLimitConfig>,

    /// Circuit breaker applied to every operation
    pub breaker: BreakerConfig,

    /// Retry coordinator backoff
    pub retry: RetryConfig,

    /// Persistent quota tracker
    pub quota: QuotaConfig,

    /// Operator HTTP view
    pub status: StatusConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (json, pretty, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Where bucket (and by default quota) state lives
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,

    /// Redis connection URL (backend = "redis")
    pub redis_url: String,

    /// Prefix for bucket keys
    pub key_prefix: String,

    /// Behaviour when the store cannot be reached
    pub failure_policy: StoreFailurePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ratekeeper:bucket:".to_string(),
            failure_policy: StoreFailurePolicy::FailClosed,
        }
    }
}

impl StoreConfig {
    /// Prefix for quota keys, in the same namespace as `key_prefix`.
    ///
    /// `"ratekeeper:bucket:"` maps to `"ratekeeper:quota:"`; any other prefix
    /// gets `"quota:"` appended.
    pub fn quota_key_prefix(&self) -> String {
        let namespace = self
            .key_prefix
            .strip_suffix("bucket:")
            .unwrap_or(&self.key_prefix);
        format!("{}quota:", namespace)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    /// Queue wait bound for callers that pass no timeout
    pub default_timeout_ms: u64,

    /// Upper bound of the random pause after each queued grant
    pub queue_jitter_ms: u64,

    /// Interval of the pruning / gauge refresh task
    pub maintenance_interval_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            queue_jitter_ms: 50,
            maintenance_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub volume_threshold: u32,
    pub monitoring_period_ms: u64,
    pub reset_timeout_ms: u64,
    pub half_open_max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            volume_threshold: 10,
            monitoring_period_ms: 300_000,
            reset_timeout_ms: 60_000,
            half_open_max_attempts: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_jitter_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_jitter_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaBackend {
    #[default]
    Memory,
    File,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QuotaConfig {
    pub enabled: bool,
    pub backend: QuotaBackend,

    /// JSON state file (backend = "file")
    pub state_file: String,

    /// Owner charged by the retry coordinator
    pub owner: String,

    pub max_tokens: f64,
    pub regen_per_minute: f64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: QuotaBackend::Memory,
            state_file: "./ratekeeper-quota.json".to_string(),
            owner: "default".to_string(),
            max_tokens: 200.0,
            regen_per_minute: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed or is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from_path(Self::config_path())
    }

    /// Load configuration from a specific path
    ///
    /// A missing file yields the defaults (plus environment overrides).
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file from {:?}", path))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file from {:?}", path))?;
            tracing::info!("Loaded configuration from {:?}", path);
            config
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Self::default()
        };

        let config = config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// RATEKEEPER_CONFIG if set, otherwise `ratekeeper.toml` in the working directory
    pub fn config_path() -> PathBuf {
        std::env::var("RATEKEEPER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ratekeeper.toml"))
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Environment variables take precedence over config file values:
    /// - RATEKEEPER_LOG_LEVEL
    /// - RATEKEEPER_LOG_FORMAT
    /// - RATEKEEPER_STORE_BACKEND
    /// - RATEKEEPER_REDIS_URL
    /// - RATEKEEPER_FAILURE_POLICY
    /// - RATEKEEPER_STATUS_ENABLED
    /// - RATEKEEPER_STATUS_PORT
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("RATEKEEPER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("RATEKEEPER_LOG_FORMAT") {
            self.logging.format = format;
        }

        if let Ok(backend) = std::env::var("RATEKEEPER_STORE_BACKEND") {
            match backend.to_lowercase().as_str() {
                "memory" => self.store.backend = StoreBackend::Memory,
                "redis" => self.store.backend = StoreBackend::Redis,
                other => tracing::warn!(backend = other, "Ignoring unknown RATEKEEPER_STORE_BACKEND"),
            }
        }
        if let Ok(url) = std::env::var("RATEKEEPER_REDIS_URL") {
            self.store.redis_url = url;
        }
        if let Ok(policy) = std::env::var("RATEKEEPER_FAILURE_POLICY") {
            match policy.to_lowercase().as_str() {
                "fail_closed" => self.store.failure_policy = StoreFailurePolicy::FailClosed,
                "fail_open" => self.store.failure_policy = StoreFailurePolicy::FailOpen,
                other => tracing::warn!(policy = other, "Ignoring unknown RATEKEEPER_FAILURE_POLICY"),
            }
        }

        if let Ok(enabled) = std::env::var("RATEKEEPER_STATUS_ENABLED") {
            self.status.enabled = enabled.parse().unwrap_or(self.status.enabled);
        }
        if let Ok(port) = std::env::var("RATEKEEPER_STATUS_PORT") {
            if let Ok(port) = port.parse::<u16>() {
                self.status.port = port;
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                self.logging.level
            ),
        }
        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" | "compact" => {}
            _ => anyhow::bail!(
                "Invalid log format: {}. Must be one of: json, pretty, compact",
                self.logging.format
            ),
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            anyhow::bail!("Redis store selected but no redis_url configured");
        }
        #[cfg(not(feature = "redis-store"))]
        if self.store.backend == StoreBackend::Redis || self.quota.backend == QuotaBackend::Redis {
            anyhow::bail!("Redis backend requires the `redis-store` feature");
        }

        if self.limiter.default_timeout_ms == 0 {
            anyhow::bail!("limiter.default_timeout_ms must be > 0");
        }
        if self.limiter.maintenance_interval_ms == 0 {
            anyhow::bail!("limiter.maintenance_interval_ms must be > 0");
        }

        // Duplicate and malformed operations are reported by the registry itself
        self.registry()?;

        if self.breaker.failure_threshold == 0 {
            anyhow::bail!("breaker.failure_threshold must be > 0");
        }
        if self.breaker.half_open_max_attempts == 0 {
            anyhow::bail!("breaker.half_open_max_attempts must be > 0");
        }
        if self.breaker.monitoring_period_ms == 0 {
            anyhow::bail!("breaker.monitoring_period_ms must be > 0");
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            anyhow::bail!("retry.max_delay_ms must be >= retry.base_delay_ms");
        }

        if self.quota.enabled {
            self.quota_limits().validate()?;
            if self.quota.owner.is_empty() {
                anyhow::bail!("quota.owner must not be empty");
            }
            if self.quota.backend == QuotaBackend::File && self.quota.state_file.is_empty() {
                anyhow::bail!("File quota backend selected but no state_file configured");
            }
        }

        if self.status.enabled && self.status.port == 0 {
            anyhow::bail!("Status port must be > 0");
        }

        Ok(())
    }

    /// Convert log level string to tracing::Level
    pub fn log_level(&self) -> Result<tracing::Level> {
        self.logging
            .level
            .to_lowercase()
            .parse()
            .map_err(|e| anyhow::anyhow!("Failed to parse log level: {}", e))
    }

    /// Operation registry from `[[operations]]`, or the built-in table
    pub fn registry(&self) -> Result<OperationRegistry> {
        if self.operations.is_empty() {
            Ok(OperationRegistry::builtin())
        } else {
            OperationRegistry::new(self.operations.clone()).context("Invalid [[operations]] table")
        }
    }

    pub fn limiter_settings(&self) -> LimiterSettings {
        LimiterSettings {
            default_timeout: Duration::from_millis(self.limiter.default_timeout_ms),
            queue_jitter: Duration::from_millis(self.limiter.queue_jitter_ms),
            failure_policy: self.store.failure_policy,
        }
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.limiter.maintenance_interval_ms)
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.breaker.failure_threshold,
            volume_threshold: self.breaker.volume_threshold,
            monitoring_period: Duration::from_millis(self.breaker.monitoring_period_ms),
            reset_timeout: Duration::from_millis(self.breaker.reset_timeout_ms),
            half_open_max_attempts: self.breaker.half_open_max_attempts,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .max_retries(self.retry.max_retries)
            .base_delay(Duration::from_millis(self.retry.base_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .max_jitter(Duration::from_millis(self.retry.max_jitter_ms))
    }

    pub fn quota_limits(&self) -> QuotaLimits {
        QuotaLimits::new(self.quota.max_tokens, self.quota.regen_per_minute)
    }
}
