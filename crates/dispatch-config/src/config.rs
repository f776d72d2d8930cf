//! Main configuration types.
//!
//! This module provides the top-level [`DispatchConfig`] struct and its builder.

use serde::{Deserialize, Serialize};

use crate::{
    CircuitBreakerConfig, InboxConfig, LoggingConfig, MetricsConfig, PipelineConfig,
    RateLimitConfig, RetryConfig, TimeoutConfig,
};

/// Complete Dispatch configuration.
///
/// This is the root configuration type that contains all configuration sections.
/// Use [`ConfigLoader`](crate::ConfigLoader) to load configuration from files
/// and environment variables.
///
/// # Example
///
/// ```
/// use dispatch_config::DispatchConfig;
///
/// let config = DispatchConfig::default();
/// assert_eq!(config.retry.max_attempts, 3);
/// assert!(config.circuit_breaker.enabled);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct DispatchConfig {
    /// Pipeline configuration.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Circuit breaker configuration.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Rate limit configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Timeout configuration.
    #[serde(default)]
    pub timeout: TimeoutConfig,

    /// Inbox (deduplication) configuration.
    #[serde(default)]
    pub inbox: InboxConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl DispatchConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> DispatchConfigBuilder {
        DispatchConfigBuilder::new()
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), crate::ConfigError> {
        self.pipeline.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.timeout.validate()?;

        if self.inbox.enabled && self.inbox.memory_capacity == 0 {
            return Err(crate::ConfigError::invalid_value(
                "inbox.memory_capacity",
                "must be greater than 0",
            ));
        }

        if self.metrics.enabled
            && self
                .metrics
                .addr
                .parse::<std::net::SocketAddr>()
                .is_err()
        {
            return Err(crate::ConfigError::invalid_value(
                "metrics.addr",
                format!("invalid socket address: {}", self.metrics.addr),
            ));
        }

        Ok(())
    }

    /// Create a development configuration preset.
    ///
    /// Pretty debug logging and short retry delays.
    ///
    /// # Example
    ///
    /// ```
    /// use dispatch_config::{DispatchConfig, LogFormat};
    ///
    /// let config = DispatchConfig::development();
    /// assert_eq!(config.logging.level, "debug");
    /// assert_eq!(config.logging.format, LogFormat::Pretty);
    /// ```
    #[must_use]
    pub fn development() -> Self {
        let mut config = Self::default();

        config.logging.level = "debug".to_string();
        config.logging.format = crate::LogFormat::Pretty;
        config.logging.include_location = true;

        config.retry.base_delay_ms = 10;
        config.retry.max_delay_ms = 1_000;

        config
    }

    /// Create a production configuration preset.
    ///
    /// JSON info logging, jittered backoff and the Prometheus exporter.
    #[must_use]
    pub fn production() -> Self {
        let mut config = Self::default();

        config.logging.level = "info".to_string();
        config.logging.format = crate::LogFormat::Json;

        config.retry.backoff = crate::BackoffStrategy::ExponentialWithJitter;
        config.metrics.enabled = true;

        config
    }
}

/// Builder for [`DispatchConfig`].
#[derive(Debug, Default)]
pub struct DispatchConfigBuilder {
    pipeline: Option<PipelineConfig>,
    circuit_breaker: Option<CircuitBreakerConfig>,
    rate_limit: Option<RateLimitConfig>,
    retry: Option<RetryConfig>,
    timeout: Option<TimeoutConfig>,
    inbox: Option<InboxConfig>,
    logging: Option<LoggingConfig>,
    metrics: Option<MetricsConfig>,
}

impl DispatchConfigBuilder {
    /// Create a new builder with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pipeline configuration.
    #[must_use]
    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Set the circuit breaker configuration.
    #[must_use]
    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(circuit_breaker);
        self
    }

    /// Set the rate limit configuration.
    #[must_use]
    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    /// Set the retry configuration.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the timeout configuration.
    #[must_use]
    pub fn timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the inbox configuration.
    #[must_use]
    pub fn inbox(mut self, inbox: InboxConfig) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Set the logging configuration.
    #[must_use]
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    /// Set the metrics configuration.
    #[must_use]
    pub fn metrics(mut self, metrics: MetricsConfig) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the configuration.
    ///
    /// Any unset sections will use their default values.
    #[must_use]
    pub fn build(self) -> DispatchConfig {
        DispatchConfig {
            pipeline: self.pipeline.unwrap_or_default(),
            circuit_breaker: self.circuit_breaker.unwrap_or_default(),
            rate_limit: self.rate_limit.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            timeout: self.timeout.unwrap_or_default(),
            inbox: self.inbox.unwrap_or_default(),
            logging: self.logging.unwrap_or_default(),
            metrics: self.metrics.unwrap_or_default(),
        }
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if validation fails.
    pub fn build_validated(self) -> Result<DispatchConfig, crate::ConfigError> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}
