//! Configuration loader with layered approach.
//!
//! This module provides the [`ConfigLoader`] for loading configuration from
//! multiple sources: defaults, files, strings and environment variables.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::de::DeserializeOwned;

use crate::{ConfigError, DispatchConfig};

/// Configuration loader with layered approach.
///
/// The loader applies configuration in layers, with later layers overriding
/// earlier ones:
/// 1. Default values (built into the code)
/// 2. Configuration file or string (TOML or JSON)
/// 3. Environment variables (`PREFIX__SECTION__KEY`)
///
/// # Example
///
/// ```no_run
/// use dispatch_config::ConfigLoader;
///
/// # fn main() -> Result<(), dispatch_config::ConfigError> {
/// let config = ConfigLoader::new()
///     .with_defaults()
///     .with_file("dispatch.toml")?
///     .with_env_prefix("DISPATCH")
///     .load()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config: DispatchConfig,
    env_prefix: Option<String>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// Create a new configuration loader.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: DispatchConfig::default(),
            env_prefix: None,
        }
    }

    /// Start with default configuration values.
    ///
    /// This is called automatically by `new()`, but can be chained for clarity.
    #[must_use]
    pub fn with_defaults(mut self) -> Self {
        self.config = DispatchConfig::default();
        self
    }

    /// Start with the development preset.
    #[must_use]
    pub fn with_development(mut self) -> Self {
        self.config = DispatchConfig::development();
        self
    }

    /// Start with the production preset.
    #[must_use]
    pub fn with_production(mut self) -> Self {
        self.config = DispatchConfig::production();
        self
    }

    /// Load configuration from a file.
    ///
    /// The format is determined by the extension (`.toml` or `.json`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file is missing, unreadable, malformed or
    /// contains unknown fields.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::file_not_found(path));
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::read_error(path, e))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase);

        self.config = match extension.as_deref() {
            Some("toml") => toml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => return Err(ConfigError::UnsupportedFormat(path.display().to_string())),
        };

        Ok(self)
    }

    /// Load configuration from a file if it exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be loaded.
    pub fn with_optional_file<P: AsRef<Path>>(self, path: P) -> Result<Self, ConfigError> {
        if path.as_ref().exists() {
            self.with_file(path)
        } else {
            Ok(self)
        }
    }

    /// Load configuration from a string in the given format (`toml` or `json`).
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if parsing fails.
    ///
    /// # Example
    ///
    /// ```
    /// use dispatch_config::ConfigLoader;
    ///
    /// let toml = r#"
    ///     [retry]
    ///     max_attempts = 5
    /// "#;
    ///
    /// let config = ConfigLoader::new()
    ///     .with_string(toml, "toml")
    ///     .unwrap()
    ///     .load()
    ///     .unwrap();
    ///
    /// assert_eq!(config.retry.max_attempts, 5);
    /// ```
    pub fn with_string(mut self, content: &str, format: &str) -> Result<Self, ConfigError> {
        self.config = match format.to_lowercase().as_str() {
            "toml" => toml::from_str(content)?,
            "json" => serde_json::from_str(content)?,
            _ => return Err(ConfigError::UnsupportedFormat(format.to_string())),
        };
        Ok(self)
    }

    /// Set environment variable prefix for overrides.
    ///
    /// Environment variables use the format `PREFIX__SECTION__KEY`, e.g.
    /// `DISPATCH__RETRY__MAX_ATTEMPTS=5`.
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_uppercase());
        self
    }

    /// Finalize and return the loaded configuration.
    ///
    /// Applies environment variable overrides (if a prefix was set) and
    /// validates the final configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if an override cannot be parsed or validation fails.
    pub fn load(mut self) -> Result<DispatchConfig, ConfigError> {
        if let Some(prefix) = self.env_prefix.take() {
            self.apply_env_overrides(&prefix)?;
        }

        self.config.validate()?;

        Ok(self.config)
    }

    /// Finalize without validation.
    #[must_use]
    pub fn load_unvalidated(self) -> DispatchConfig {
        self.config
    }

    fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let env_vars: HashMap<String, String> = env::vars()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect();

        for (key, value) in env_vars {
            self.apply_env_var(&key, &value, prefix)?;
        }

        Ok(())
    }

    fn apply_env_var(&mut self, key: &str, value: &str, prefix: &str) -> Result<(), ConfigError> {
        let key_without_prefix = key
            .strip_prefix(prefix)
            .and_then(|k| k.strip_prefix("__"))
            .ok_or_else(|| ConfigError::env_parse_error(key, "invalid key format"))?;

        let parts: Vec<&str> = key_without_prefix.split("__").collect();
        let config = &mut self.config;

        match parts.as_slice() {
            ["PIPELINE", "FEATURES"] => {
                config.pipeline.features = parse_list(value);
            }

            ["CIRCUIT_BREAKER", "ENABLED"] => config.circuit_breaker.enabled = bool_var(key, value)?,
            ["CIRCUIT_BREAKER", "FAILURE_THRESHOLD"] => {
                config.circuit_breaker.failure_threshold = number_var(key, value)?;
            }
            ["CIRCUIT_BREAKER", "OPEN_DURATION_MS"] => {
                config.circuit_breaker.open_duration_ms = number_var(key, value)?;
            }
            ["CIRCUIT_BREAKER", "KEY"] => config.circuit_breaker.key = enum_var(key, value)?,

            ["RATE_LIMIT", "ENABLED"] => config.rate_limit.enabled = bool_var(key, value)?,
            ["RATE_LIMIT", "PARTITION"] => config.rate_limit.partition = enum_var(key, value)?,

            ["RETRY", "ENABLED"] => config.retry.enabled = bool_var(key, value)?,
            ["RETRY", "MAX_ATTEMPTS"] => config.retry.max_attempts = number_var(key, value)?,
            ["RETRY", "BACKOFF"] => config.retry.backoff = enum_var(key, value)?,
            ["RETRY", "BASE_DELAY_MS"] => config.retry.base_delay_ms = number_var(key, value)?,
            ["RETRY", "MAX_DELAY_MS"] => config.retry.max_delay_ms = number_var(key, value)?,
            ["RETRY", "JITTER_FACTOR"] => config.retry.jitter_factor = number_var(key, value)?,
            ["RETRY", "RETRY_ON"] => config.retry.retry_on = parse_list(value),
            ["RETRY", "NEVER_RETRY_ON"] => config.retry.never_retry_on = parse_list(value),

            ["TIMEOUT", "ENABLED"] => config.timeout.enabled = bool_var(key, value)?,
            ["TIMEOUT", "DEFAULT_TIMEOUT_MS"] => {
                config.timeout.default_timeout_ms = number_var(key, value)?;
            }
            ["TIMEOUT", "ACTION_TIMEOUT_MS"] => {
                config.timeout.action_timeout_ms = optional_number_var(key, value)?;
            }
            ["TIMEOUT", "EVENT_TIMEOUT_MS"] => {
                config.timeout.event_timeout_ms = optional_number_var(key, value)?;
            }
            ["TIMEOUT", "DOCUMENT_TIMEOUT_MS"] => {
                config.timeout.document_timeout_ms = optional_number_var(key, value)?;
            }
            ["TIMEOUT", "THROW_ON_TIMEOUT"] => {
                config.timeout.throw_on_timeout = bool_var(key, value)?;
            }

            ["INBOX", "ENABLED"] => config.inbox.enabled = bool_var(key, value)?,
            ["INBOX", "POLICY"] => config.inbox.policy = enum_var(key, value)?,
            ["INBOX", "MEMORY_CAPACITY"] => config.inbox.memory_capacity = number_var(key, value)?,

            ["LOGGING", "ENABLED"] => config.logging.enabled = bool_var(key, value)?,
            ["LOGGING", "LEVEL"] => config.logging.level = value.to_string(),
            ["LOGGING", "FORMAT"] => config.logging.format = enum_var(key, value)?,
            ["LOGGING", "INCLUDE_LOCATION"] => {
                config.logging.include_location = bool_var(key, value)?;
            }

            ["METRICS", "ENABLED"] => config.metrics.enabled = bool_var(key, value)?,
            ["METRICS", "ADDR"] => config.metrics.addr = value.to_string(),

            // Unknown key - ignore
            _ => {}
        }

        Ok(())
    }
}

/// Parse a boolean from a string.
fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a comma-separated list, dropping blank entries.
fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn bool_var(key: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env_parse_error(key, "expected boolean"))
}

fn number_var<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::env_parse_error(key, "expected number"))
}

fn optional_number_var<T: FromStr>(key: &str, value: &str) -> Result<Option<T>, ConfigError> {
    if value.is_empty() || value.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        number_var(key, value).map(Some)
    }
}

/// Parse a snake_case enum variant through its serde representation.
fn enum_var<T: DeserializeOwned>(key: &str, value: &str) -> Result<T, ConfigError> {
    serde_json::from_value(serde_json::Value::String(value.trim().to_lowercase()))
        .map_err(|e| ConfigError::env_parse_error(key, e.to_string()))
}
