//! Typed configuration for Dispatch.
//!
//! This crate provides a strongly-typed configuration system for the Dispatch
//! pipeline and its resilience units, with support for:
//! - TOML and JSON configuration files
//! - Environment variable overrides
//! - Strict validation (fails on unknown fields)
//! - Layered configuration (defaults → file → env)
//!
//! # Example
//!
//! ```no_run
//! use dispatch_config::ConfigLoader;
//!
//! # fn main() -> Result<(), dispatch_config::ConfigError> {
//! let config = ConfigLoader::new()
//!     .with_defaults()
//!     .with_file("dispatch.toml")?
//!     .with_env_prefix("DISPATCH")
//!     .load()?;
//!
//! println!("Circuit opens after {} failures", config.circuit_breaker.failure_threshold);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration File Format
//!
//! ```toml
//! [pipeline]
//! features = ["audit"]
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! open_duration_ms = 30000
//! key = "message_type"
//!
//! [rate_limit.global]
//! algorithm = "token_bucket"
//! token_limit = 100
//! tokens_per_period = 100
//! replenishment_period_ms = 1000
//!
//! [rate_limit.per_key]
//! algorithm = "sliding_window"
//! permit_limit = 20
//! window_ms = 1000
//! segments_per_window = 4
//!
//! [retry]
//! max_attempts = 3
//! backoff = "exponential_with_jitter"
//! base_delay_ms = 100
//! max_delay_ms = 30000
//! never_retry_on = ["ValidationFailure"]
//!
//! [timeout]
//! default_timeout_ms = 30000
//! event_timeout_ms = 5000
//!
//! [timeout.message_types]
//! ExportReport = 120000
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```
//!
//! # Environment Variable Overrides
//!
//! Scalar values can be overridden via environment variables using the
//! format `PREFIX__SECTION__KEY`. For example:
//!
//! - `DISPATCH__RETRY__MAX_ATTEMPTS=5`
//! - `DISPATCH__CIRCUIT_BREAKER__KEY=tenant`
//! - `DISPATCH__LOGGING__FORMAT=pretty`

#![warn(missing_docs)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::*;
pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use schema::*;
