//! Setup error types.

use dispatch_config::ConfigError;
use dispatch_telemetry::TelemetryError;
use thiserror::Error;

/// Errors raised while loading configuration or assembling a pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Configuration could not be loaded or failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Logging or metrics could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SetupError::from(ConfigError::invalid_value("retry.max_attempts", "must be greater than 0"));
        assert_eq!(
            err.to_string(),
            "invalid configuration value for retry.max_attempts: must be greater than 0"
        );

        let err = SetupError::from(TelemetryError::InvalidAddress("localhost".to_string()));
        assert_eq!(err.to_string(), "Invalid address: localhost");
    }
}
