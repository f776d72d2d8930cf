//! Configuration schema types.
//!
//! This module defines the structure of all configuration sections. Durations
//! are expressed in milliseconds; each section exposes `Duration` accessors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

fn default_true() -> bool {
    true
}

/// Message types and marker tags that skip a resilience unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BypassConfig {
    /// Message type names that skip the unit.
    #[serde(default)]
    pub message_types: Vec<String>,

    /// Marker tags that skip the unit.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// How a per-key resilience unit derives its key from a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One key shared by every message.
    #[default]
    Global,
    /// One key per message type name.
    MessageType,
    /// One key per resolved tenant.
    Tenant,
}

/// Pipeline section.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Feature names enabled for this deployment.
    ///
    /// Units that require a feature missing from this list are dropped when
    /// the pipeline is built.
    #[serde(default)]
    pub features: Vec<String>,
}

/// Circuit breaker section.
///
/// # Example
///
/// ```
/// use dispatch_config::CircuitBreakerConfig;
/// use std::time::Duration;
///
/// let config = CircuitBreakerConfig::default();
/// assert_eq!(config.failure_threshold, 5);
/// assert_eq!(config.open_duration(), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Enable the circuit breaker.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that open a circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time an open circuit waits before admitting a trial call.
    #[serde(default = "default_open_duration_ms")]
    pub open_duration_ms: u64,

    /// Circuit key derivation.
    #[serde(default)]
    pub key: KeyStrategy,

    /// Messages that skip the circuit breaker.
    #[serde(default)]
    pub bypass: BypassConfig,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            open_duration_ms: default_open_duration_ms(),
            key: KeyStrategy::default(),
            bypass: BypassConfig::default(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Returns the open duration.
    #[must_use]
    pub const fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_duration_ms() -> u64 {
    30_000
}

/// Settings of one rate limiter, tagged by algorithm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum LimiterConfig {
    /// Token bucket with lazy whole-period refill.
    TokenBucket {
        /// Bucket capacity.
        token_limit: u32,
        /// Tokens added per period.
        tokens_per_period: u32,
        /// Refill period.
        replenishment_period_ms: u64,
    },
    /// Counter reset at fixed window boundaries.
    FixedWindow {
        /// Permits per window.
        permit_limit: u32,
        /// Window length.
        window_ms: u64,
    },
    /// Window split into segments that expire one by one.
    SlidingWindow {
        /// Permits per window.
        permit_limit: u32,
        /// Window length.
        window_ms: u64,
        /// Segments per window.
        segments_per_window: u32,
    },
    /// Cap on in-flight messages.
    Concurrency {
        /// Maximum in-flight messages.
        max_concurrency: u32,
    },
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self::TokenBucket {
            token_limit: 100,
            tokens_per_period: 100,
            replenishment_period_ms: 1_000,
        }
    }
}

impl LimiterConfig {
    fn validate(&self, field: &str) -> Result<(), crate::ConfigError> {
        let positive = |name: &str, value: u64| {
            if value == 0 {
                Err(crate::ConfigError::invalid_value(
                    format!("{field}.{name}"),
                    "must be greater than 0",
                ))
            } else {
                Ok(())
            }
        };

        match *self {
            Self::TokenBucket {
                token_limit,
                tokens_per_period,
                replenishment_period_ms,
            } => {
                positive("token_limit", token_limit.into())?;
                positive("tokens_per_period", tokens_per_period.into())?;
                positive("replenishment_period_ms", replenishment_period_ms)
            }
            Self::FixedWindow {
                permit_limit,
                window_ms,
            } => {
                positive("permit_limit", permit_limit.into())?;
                positive("window_ms", window_ms)
            }
            Self::SlidingWindow {
                permit_limit,
                window_ms,
                segments_per_window,
            } => {
                positive("permit_limit", permit_limit.into())?;
                positive("window_ms", window_ms)?;
                positive("segments_per_window", segments_per_window.into())?;
                if window_ms < u64::from(segments_per_window) {
                    return Err(crate::ConfigError::invalid_value(
                        format!("{field}.segments_per_window"),
                        "must not exceed window_ms",
                    ));
                }
                Ok(())
            }
            Self::Concurrency { max_concurrency } => {
                positive("max_concurrency", max_concurrency.into())
            }
        }
    }
}

/// Rate limit section.
///
/// A global limiter and a per-key limiter may be configured together; a
/// message is admitted only if both admit it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Limiter shared by every message.
    #[serde(default)]
    pub global: Option<LimiterConfig>,

    /// Limiter applied per partition key.
    #[serde(default)]
    pub per_key: Option<LimiterConfig>,

    /// Partition key derivation for the per-key limiter.
    #[serde(default = "default_partition")]
    pub partition: KeyStrategy,

    /// Messages that skip rate limiting.
    #[serde(default)]
    pub bypass: BypassConfig,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: Some(LimiterConfig::default()),
            per_key: None,
            partition: default_partition(),
            bypass: BypassConfig::default(),
        }
    }
}

fn default_partition() -> KeyStrategy {
    KeyStrategy::Tenant
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Every delay equals the base delay.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
    /// Exponential, randomized by the jitter factor.
    ExponentialWithJitter,
}

/// Retry section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Enable retries.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Total attempts, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay growth.
    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Base delay.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap applied to every delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Jitter factor in `0.0..=1.0`.
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,

    /// Error type names that are retried. Empty means every error except
    /// programmer errors.
    #[serde(default)]
    pub retry_on: Vec<String>,

    /// Error type names that are never retried.
    #[serde(default)]
    pub never_retry_on: Vec<String>,

    /// Messages that skip retries.
    #[serde(default)]
    pub bypass: BypassConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            backoff: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
            retry_on: Vec::new(),
            never_retry_on: Vec::new(),
            bypass: BypassConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Returns the base delay.
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Returns the delay cap.
    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter_factor() -> f64 {
    0.2
}

/// Timeout section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Enable the timeout guard.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deadline used when nothing more specific applies.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    /// Deadline for action messages.
    #[serde(default)]
    pub action_timeout_ms: Option<u64>,

    /// Deadline for event messages.
    #[serde(default)]
    pub event_timeout_ms: Option<u64>,

    /// Deadline for document messages.
    #[serde(default)]
    pub document_timeout_ms: Option<u64>,

    /// Deadlines per message type name.
    #[serde(default)]
    pub message_types: HashMap<String, u64>,

    /// Raise `MessageTimeout` as an error instead of returning a failed outcome.
    #[serde(default = "default_true")]
    pub throw_on_timeout: bool,

    /// Messages that skip the timeout guard.
    #[serde(default)]
    pub bypass: BypassConfig,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_timeout_ms: default_timeout_ms(),
            action_timeout_ms: None,
            event_timeout_ms: None,
            document_timeout_ms: None,
            message_types: HashMap::new(),
            throw_on_timeout: true,
            bypass: BypassConfig::default(),
        }
    }
}

impl TimeoutConfig {
    /// Returns the default deadline.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Which deduplication backend the inbox stage uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InboxPolicy {
    /// Use the persistent store when one is supplied, the in-memory set otherwise.
    #[default]
    PreferStore,
    /// Always use the in-memory set.
    MemoryOnly,
}

/// Inbox (deduplication) section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct InboxConfig {
    /// Enable deduplication.
    #[serde(default)]
    pub enabled: bool,

    /// Backend selection.
    #[serde(default)]
    pub policy: InboxPolicy,

    /// Ids remembered by the in-memory set before the oldest are evicted.
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
}

impl Default for InboxConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            policy: InboxPolicy::default(),
            memory_capacity: default_memory_capacity(),
        }
    }
}

fn default_memory_capacity() -> usize {
    10_000
}

/// Log format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON formatted logs (production).
    #[default]
    Json,
    /// Human-readable pretty format (development).
    Pretty,
}

/// Logging section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable logging.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Log level or filter directive (e.g. `info`, `dispatch_middleware=debug`).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include source file and line in logs.
    #[serde(default)]
    pub include_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            include_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Metrics section.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Install the Prometheus exporter.
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus scrape endpoint address.
    #[serde(default = "default_metrics_addr")]
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

impl PipelineConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::ConfigError> {
        if let Some(feature) = self.features.iter().find(|f| f.trim().is_empty()) {
            return Err(crate::ConfigError::invalid_value(
                "pipeline.features",
                format!("feature names must not be blank: {feature:?}"),
            ));
        }
        Ok(())
    }
}

impl CircuitBreakerConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::ConfigError> {
        if self.failure_threshold == 0 {
            return Err(crate::ConfigError::invalid_value(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.open_duration_ms == 0 {
            return Err(crate::ConfigError::invalid_value(
                "circuit_breaker.open_duration_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl RateLimitConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::ConfigError> {
        if let Some(global) = &self.global {
            global.validate("rate_limit.global")?;
        }
        if let Some(per_key) = &self.per_key {
            per_key.validate("rate_limit.per_key")?;
        }
        Ok(())
    }
}

impl RetryConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::ConfigError> {
        if self.max_attempts == 0 {
            return Err(crate::ConfigError::invalid_value(
                "retry.max_attempts",
                "must be at least 1",
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(crate::ConfigError::invalid_value(
                "retry.base_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(crate::ConfigError::invalid_value(
                "retry.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }
}

impl TimeoutConfig {
    pub(crate) fn validate(&self) -> Result<(), crate::ConfigError> {
        let zero = [
            ("timeout.default_timeout_ms", Some(self.default_timeout_ms)),
            ("timeout.action_timeout_ms", self.action_timeout_ms),
            ("timeout.event_timeout_ms", self.event_timeout_ms),
            ("timeout.document_timeout_ms", self.document_timeout_ms),
        ]
        .into_iter()
        .find(|(_, value)| *value == Some(0));

        if let Some((field, _)) = zero {
            return Err(crate::ConfigError::invalid_value(field, "must be greater than 0"));
        }
        if let Some(name) = self
            .message_types
            .iter()
            .find_map(|(name, ms)| (*ms == 0).then_some(name))
        {
            return Err(crate::ConfigError::invalid_value(
                format!("timeout.message_types.{name}"),
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_config_tagged_by_algorithm() {
        let toml_str = r#"
            algorithm = "sliding_window"
            permit_limit = 10
            window_ms = 1000
            segments_per_window = 4
        "#;

        let limiter: LimiterConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            limiter,
            LimiterConfig::SlidingWindow {
                permit_limit: 10,
                window_ms: 1000,
                segments_per_window: 4,
            }
        );
    }

    #[test]
    fn test_limiter_validation() {
        let zero = LimiterConfig::FixedWindow {
            permit_limit: 0,
            window_ms: 1000,
        };
        let err = zero.validate("rate_limit.global").unwrap_err();
        assert!(err.to_string().contains("rate_limit.global.permit_limit"));

        let too_many_segments = LimiterConfig::SlidingWindow {
            permit_limit: 1,
            window_ms: 3,
            segments_per_window: 4,
        };
        assert!(too_many_segments.validate("rate_limit.per_key").is_err());

        assert!(LimiterConfig::default().validate("rate_limit.global").is_ok());
    }

    #[test]
    fn test_backoff_strategy_names() {
        let strategy: BackoffStrategy =
            serde_json::from_str("\"exponential_with_jitter\"").unwrap();
        assert_eq!(strategy, BackoffStrategy::ExponentialWithJitter);
    }

    #[test]
    fn test_retry_validation() {
        let config = RetryConfig {
            base_delay_ms: 500,
            max_delay_ms: 100,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RetryConfig {
            jitter_factor: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeout_validation() {
        let mut config = TimeoutConfig::default();
        config.message_types.insert("Export".to_string(), 0);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeout.message_types.Export"));

        let config = TimeoutConfig {
            event_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duration_accessors() {
        let retry = RetryConfig::default();
        assert_eq!(retry.base_delay(), Duration::from_millis(100));
        assert_eq!(retry.max_delay(), Duration::from_secs(30));
        assert_eq!(TimeoutConfig::default().default_timeout(), Duration::from_secs(30));
    }
}
