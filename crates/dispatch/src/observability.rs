//! Telemetry setup from a [`DispatchConfig`].

use crate::SetupError;
use dispatch_config::{DispatchConfig, LogFormat};
use dispatch_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};

/// Maps the `logging` and `metrics` sections onto telemetry settings.
#[must_use]
pub fn telemetry_config(config: &DispatchConfig) -> TelemetryConfig {
    TelemetryConfig {
        logging: LogConfig {
            enabled: config.logging.enabled,
            level: config.logging.level.clone(),
            json_format: config.logging.format == LogFormat::Json,
            file_line_info: config.logging.include_location,
            ..LogConfig::default()
        },
        metrics: MetricsConfig {
            enabled: config.metrics.enabled,
            addr: Some(config.metrics.addr.clone()),
        },
    }
}

/// Installs the global subscriber and, when enabled, the metrics exporter.
///
/// Call once at startup, inside the tokio runtime when the exporter listens
/// on an address.
pub fn init_telemetry(config: &DispatchConfig) -> Result<(), SetupError> {
    dispatch_telemetry::init_telemetry(&telemetry_config(config))?;
    tracing::info!(
        level = %config.logging.level,
        metrics = config.metrics.enabled,
        "Telemetry initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_development_maps_to_pretty() {
        let telemetry = telemetry_config(&DispatchConfig::development());

        assert!(telemetry.logging.enabled);
        assert_eq!(telemetry.logging.level, "debug");
        assert!(!telemetry.logging.json_format);
        assert!(telemetry.logging.file_line_info);
        assert!(!telemetry.metrics.enabled);
    }

    #[test]
    fn test_production_maps_to_json_with_exporter() {
        let config = DispatchConfig::production();
        let telemetry = telemetry_config(&config);

        assert!(telemetry.logging.json_format);
        assert!(!telemetry.logging.file_line_info);
        assert!(telemetry.metrics.enabled);
        assert_eq!(telemetry.metrics.addr.as_deref(), Some(config.metrics.addr.as_str()));
    }
}
