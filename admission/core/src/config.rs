//! TOML Configuration File Support
//!
//! Centralized configuration loading for the admission core, backed by a TOML
//! file at `~/.config/admission/admission.toml`.
//!
//! # Configuration Priority
//!
//! Values are resolved with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`ADMISSION_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [scheduler]
//! max_concurrent_tasks = 3
//!
//! [limiter]
//! default_acquire_timeout_ms = 5000
//! stale_after_ms = 300000
//!
//! [failure_policy]
//! failure_threshold = 5
//! reset_timeout_ms = 60000
//! max_requests_per_minute = 60
//!
//! [pipeline]
//! max_total_attempts = 6
//!
//! [resources."llama3.2"]
//! requests_per_second = 5.0
//! burst_limit = 10
//!
//! [resources.qwen]
//! quota_limit = 1000
//! time_window_ms = 3600000
//!
//! [fallbacks]
//! "llama3.2" = ["qwen"]
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::failure::FailurePolicyConfig;
use crate::pipeline::PipelineSettings;
use crate::rate_limit::{LimiterSettings, RateLimitConfig};
use crate::scheduler::SchedulerConfig;

/// Environment variables read by [`load_config`]
pub const ENV_VARS: &[&str] = &[
    "ADMISSION_MAX_CONCURRENT",
    "ADMISSION_ACQUIRE_TIMEOUT_MS",
    "ADMISSION_STALE_AFTER_MS",
    "ADMISSION_FAILURE_THRESHOLD",
    "ADMISSION_RESET_TIMEOUT_MS",
    "ADMISSION_MAX_REQUESTS_PER_MINUTE",
    "ADMISSION_BASE_BACKOFF_MS",
    "ADMISSION_MAX_RETRIES",
    "ADMISSION_MAX_TOTAL_ATTEMPTS",
];

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Command-line argument
    Cli,
    /// Environment variable
    Env,
    /// TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[scheduler]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerToml {
    /// Tasks allowed to run at once
    pub max_concurrent_tasks: Option<usize>,

    /// Settled tasks kept for status queries
    pub history_limit: Option<usize>,
}

/// `[limiter]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterToml {
    /// Acquire wait timeout when the caller gives none
    pub default_acquire_timeout_ms: Option<u64>,

    /// Queued requests older than this are expired
    pub stale_after_ms: Option<u64>,

    /// Stale sweep interval
    pub sweep_interval_ms: Option<u64>,

    /// Background drain interval
    pub drain_interval_ms: Option<u64>,
}

/// `[failure_policy]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FailurePolicyToml {
    /// Consecutive failures that open the circuit
    pub failure_threshold: Option<u32>,

    /// How long an open circuit stays open
    pub reset_timeout_ms: Option<u64>,

    /// Attempts per trailing minute before throttling
    pub max_requests_per_minute: Option<u32>,

    /// Cooldown handed out with throttle strategies
    pub cooldown_period_ms: Option<u64>,

    /// Backoff unit
    pub base_backoff_ms: Option<u64>,

    /// Retry budget per logical request
    pub max_retries: Option<u32>,

    /// Timeout attached to retry and fallback strategies
    pub default_timeout_ms: Option<u64>,

    /// Error log retention
    pub error_retention_ms: Option<u64>,

    /// Substrings that mark a failure as transient (replaces the defaults)
    pub transient_patterns: Option<Vec<String>>,
}

/// `[pipeline]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineToml {
    /// Upper bound on attempts across retries and fallbacks
    pub max_total_attempts: Option<u32>,

    /// Whether to spawn the limiter's background drain and sweep
    pub start_maintenance: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionToml {
    /// Scheduler section
    pub scheduler: SchedulerToml,

    /// Limiter-wide settings
    pub limiter: LimiterToml,

    /// Failure policy section
    pub failure_policy: FailurePolicyToml,

    /// Pipeline section
    pub pipeline: PipelineToml,

    /// Per-resource rate limits
    pub resources: BTreeMap<String, RateLimitConfig>,

    /// Ordered fallback chains per resource
    pub fallbacks: BTreeMap<String, Vec<String>>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved admission configuration
///
/// Use [`load_config`] to build one with proper priority handling.
#[derive(Clone, Debug)]
pub struct AdmissionConfig {
    /// Scheduler configuration
    pub scheduler: SchedulerConfig,

    /// Limiter-wide settings
    pub limiter: LimiterSettings,

    /// Failure policy configuration
    pub failure_policy: FailurePolicyConfig,

    /// Pipeline settings
    pub pipeline: PipelineSettings,

    /// Rate limits installed at startup
    pub resources: BTreeMap<String, RateLimitConfig>,

    /// Fallback chains installed at startup
    pub fallbacks: BTreeMap<String, Vec<String>>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    source: ConfigSource,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            limiter: LimiterSettings::default(),
            failure_policy: FailurePolicyConfig::default(),
            pipeline: PipelineSettings::default(),
            resources: BTreeMap::new(),
            fallbacks: BTreeMap::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl AdmissionConfig {
    /// Create a configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Add a resource rate limit
    #[must_use]
    pub fn with_resource(mut self, resource_id: impl Into<String>, config: RateLimitConfig) -> Self {
        self.resources.insert(resource_id.into(), config);
        self
    }

    /// Check values that would make a component unusable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_concurrent_tasks == 0 {
            return Err(invalid("scheduler.max_concurrent_tasks must be at least 1"));
        }
        if self.failure_policy.failure_threshold == 0 {
            return Err(invalid("failure_policy.failure_threshold must be at least 1"));
        }
        if self.pipeline.max_total_attempts == 0 {
            return Err(invalid("pipeline.max_total_attempts must be at least 1"));
        }

        for (resource_id, limit) in &self.resources {
            if !limit.requests_per_second.is_finite() || limit.requests_per_second <= 0.0 {
                return Err(invalid(format!(
                    "resources.{resource_id}.requests_per_second must be positive"
                )));
            }
            if limit.burst_limit == 0 {
                return Err(invalid(format!(
                    "resources.{resource_id}.burst_limit must be at least 1"
                )));
            }
            if limit.quota_limit.is_some() && limit.time_window_ms == 0 {
                return Err(invalid(format!(
                    "resources.{resource_id}.time_window_ms must be positive when a quota is set"
                )));
            }
        }

        for (resource_id, chain) in &self.fallbacks {
            if let Some(unknown) = chain.iter().find(|r| !self.resources.contains_key(*r)) {
                return Err(invalid(format!(
                    "fallbacks.{resource_id} names unconfigured resource {unknown}"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/admission/admission.toml`, falling back to
/// `~/.config/admission/admission.toml`.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("admission").join("admission.toml"))
}

/// Load configuration from the default path, environment and defaults
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// result fails [`AdmissionConfig::validate`]. A missing file is not an
/// error.
pub fn load_config() -> Result<AdmissionConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// With `None`, only defaults and environment variables are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<AdmissionConfig, ConfigError> {
    let mut config = AdmissionConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: AdmissionToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                resources = config.resources.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Parse a TOML document into a configuration (no environment applied)
///
/// # Errors
///
/// Returns an error if the document does not parse or fails validation.
pub fn parse_config(toml_content: &str) -> Result<AdmissionConfig, ConfigError> {
    let toml_config: AdmissionToml = toml::from_str(toml_content)?;
    let mut config = AdmissionConfig::default();
    apply_toml_config(&mut config, toml_config);
    config.source = ConfigSource::File;
    config.validate()?;
    Ok(config)
}

fn apply_toml_config(config: &mut AdmissionConfig, toml: AdmissionToml) {
    // Scheduler
    if let Some(max) = toml.scheduler.max_concurrent_tasks {
        config.scheduler.max_concurrent_tasks = max;
    }
    if let Some(limit) = toml.scheduler.history_limit {
        config.scheduler.history_limit = limit;
    }

    // Limiter
    if let Some(ms) = toml.limiter.default_acquire_timeout_ms {
        config.limiter.default_acquire_timeout_ms = ms;
    }
    if let Some(ms) = toml.limiter.stale_after_ms {
        config.limiter.stale_after_ms = ms;
    }
    if let Some(ms) = toml.limiter.sweep_interval_ms {
        config.limiter.sweep_interval_ms = ms;
    }
    if let Some(ms) = toml.limiter.drain_interval_ms {
        config.limiter.drain_interval_ms = ms;
    }

    // Failure policy
    let policy = &mut config.failure_policy;
    if let Some(threshold) = toml.failure_policy.failure_threshold {
        policy.failure_threshold = threshold;
    }
    if let Some(ms) = toml.failure_policy.reset_timeout_ms {
        policy.reset_timeout_ms = ms;
    }
    if let Some(rpm) = toml.failure_policy.max_requests_per_minute {
        policy.max_requests_per_minute = rpm;
    }
    if let Some(ms) = toml.failure_policy.cooldown_period_ms {
        policy.cooldown_period_ms = ms;
    }
    if let Some(ms) = toml.failure_policy.base_backoff_ms {
        policy.base_backoff_ms = ms;
    }
    if let Some(retries) = toml.failure_policy.max_retries {
        policy.max_retries = retries;
    }
    if let Some(ms) = toml.failure_policy.default_timeout_ms {
        policy.default_timeout_ms = ms;
    }
    if let Some(ms) = toml.failure_policy.error_retention_ms {
        policy.error_retention_ms = ms;
    }
    if let Some(patterns) = toml.failure_policy.transient_patterns {
        policy.transient_patterns = patterns;
    }

    // Pipeline
    if let Some(attempts) = toml.pipeline.max_total_attempts {
        config.pipeline.max_total_attempts = attempts;
    }
    if let Some(start) = toml.pipeline.start_maintenance {
        config.pipeline.start_maintenance = start;
    }

    config.resources.extend(toml.resources);
    config.fallbacks.extend(toml.fallbacks);
}

/// Apply `ADMISSION_*` environment variables to the config
pub fn apply_env_config(config: &mut AdmissionConfig) {
    apply_env_overrides_from(config, |key| std::env::var(key).ok());
}

/// Apply environment-style overrides read through `lookup`
///
/// Unparseable values are logged and ignored.
pub fn apply_env_overrides_from<F>(config: &mut AdmissionConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
        let raw = raw?;
        match raw.trim().parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(var = key, value = %raw, "Ignoring unparseable environment override");
                None
            }
        }
    }

    let mut touched = false;
    let read = |key: &str| lookup(key);

    if let Some(n) = parsed("ADMISSION_MAX_CONCURRENT", read("ADMISSION_MAX_CONCURRENT")) {
        config.scheduler.max_concurrent_tasks = n;
        touched = true;
    }
    if let Some(ms) = parsed("ADMISSION_ACQUIRE_TIMEOUT_MS", read("ADMISSION_ACQUIRE_TIMEOUT_MS")) {
        config.limiter.default_acquire_timeout_ms = ms;
        touched = true;
    }
    if let Some(ms) = parsed("ADMISSION_STALE_AFTER_MS", read("ADMISSION_STALE_AFTER_MS")) {
        config.limiter.stale_after_ms = ms;
        touched = true;
    }
    if let Some(n) = parsed("ADMISSION_FAILURE_THRESHOLD", read("ADMISSION_FAILURE_THRESHOLD")) {
        config.failure_policy.failure_threshold = n;
        touched = true;
    }
    if let Some(ms) = parsed("ADMISSION_RESET_TIMEOUT_MS", read("ADMISSION_RESET_TIMEOUT_MS")) {
        config.failure_policy.reset_timeout_ms = ms;
        touched = true;
    }
    if let Some(n) = parsed(
        "ADMISSION_MAX_REQUESTS_PER_MINUTE",
        read("ADMISSION_MAX_REQUESTS_PER_MINUTE"),
    ) {
        config.failure_policy.max_requests_per_minute = n;
        touched = true;
    }
    if let Some(ms) = parsed("ADMISSION_BASE_BACKOFF_MS", read("ADMISSION_BASE_BACKOFF_MS")) {
        config.failure_policy.base_backoff_ms = ms;
        touched = true;
    }
    if let Some(n) = parsed("ADMISSION_MAX_RETRIES", read("ADMISSION_MAX_RETRIES")) {
        config.failure_policy.max_retries = n;
        touched = true;
    }
    if let Some(n) = parsed("ADMISSION_MAX_TOTAL_ATTEMPTS", read("ADMISSION_MAX_TOTAL_ATTEMPTS")) {
        config.pipeline.max_total_attempts = n;
        touched = true;
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// CLI overrides applied after [`load_config`]
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Concurrency cap override
    pub max_concurrent_tasks: Option<usize>,

    /// Acquire timeout override (milliseconds)
    pub acquire_timeout_ms: Option<u64>,

    /// Circuit threshold override
    pub failure_threshold: Option<u32>,

    /// Retry budget override
    pub max_retries: Option<u32>,

    /// Attempt bound override
    pub max_total_attempts: Option<u32>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency cap override
    #[must_use]
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = Some(max);
        self
    }

    /// Set the acquire timeout override
    #[must_use]
    pub fn with_acquire_timeout_ms(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = Some(ms);
        self
    }

    /// Set the circuit threshold override
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the retry budget override
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set the attempt bound override
    #[must_use]
    pub fn with_max_total_attempts(mut self, attempts: u32) -> Self {
        self.max_total_attempts = Some(attempts);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.max_concurrent_tasks.is_none()
            && self.acquire_timeout_ms.is_none()
            && self.failure_threshold.is_none()
            && self.max_retries.is_none()
            && self.max_total_attempts.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut AdmissionConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(max) = self.max_concurrent_tasks {
            config.scheduler.max_concurrent_tasks = max;
        }
        if let Some(ms) = self.acquire_timeout_ms {
            config.limiter.default_acquire_timeout_ms = ms;
        }
        if let Some(threshold) = self.failure_threshold {
            config.failure_policy.failure_threshold = threshold;
        }
        if let Some(retries) = self.max_retries {
            config.failure_policy.max_retries = retries;
        }
        if let Some(attempts) = self.max_total_attempts {
            config.pipeline.max_total_attempts = attempts;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
