//! Resilience and dispatch metrics.
//!
//! Metrics are recorded through the `metrics` facade, so recording is a no-op
//! until a recorder is installed. [`init_metrics`] installs a Prometheus
//! recorder, optionally with its own scrape endpoint.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `dispatch_messages_total` | Counter | `message_type`, `kind`, `result`, `code` | Dispatched messages |
//! | `dispatch_duration_seconds` | Histogram | `message_type` | Time spent in the pipeline |
//! | `dispatch_in_flight_messages` | Gauge | - | Messages currently in the pipeline |
//! | `dispatch_circuit_transitions_total` | Counter | `circuit`, `from`, `to` | Circuit state changes |
//! | `dispatch_circuit_rejections_total` | Counter | `circuit` | Calls rejected by an open circuit |
//! | `dispatch_rate_limit_rejections_total` | Counter | `scope`, `algorithm` | Messages rejected by a limiter |
//! | `dispatch_retry_attempts_total` | Counter | `message_type`, `reason` | Retries scheduled |
//! | `dispatch_retries_exhausted_total` | Counter | `message_type` | Dispatches that ran out of attempts |
//! | `dispatch_timeouts_total` | Counter | `message_type` | Deadlines exceeded |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

/// Global metrics handle for rendering.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, Default)]
pub struct MetricsConfig {
    /// Whether metrics are enabled.
    pub enabled: bool,

    /// Scrape endpoint address. Without one, the recorder is installed and
    /// metrics are available through [`render_metrics`].
    pub addr: Option<String>,
}

/// Initializes the metrics subsystem.
///
/// With an address, the exporter's HTTP listener is spawned on the current
/// tokio runtime (or a background thread outside one).
///
/// # Errors
///
/// Returns `TelemetryError` if the address is invalid or a recorder is
/// already installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    match &config.addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| TelemetryError::InvalidAddress(format!("{addr}: {e}")))?;

            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
        }
        None => {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            let _ = METRICS_HANDLE.set(handle);
        }
    }

    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus format.
///
/// Returns `None` unless metrics were initialized without a scrape endpoint.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!("dispatch_messages_total", "Total number of dispatched messages");
    describe_histogram!(
        "dispatch_duration_seconds",
        "Time spent in the pipeline in seconds"
    );
    describe_gauge!(
        "dispatch_in_flight_messages",
        "Number of messages currently in the pipeline"
    );
    describe_counter!(
        "dispatch_circuit_transitions_total",
        "Circuit breaker state transitions"
    );
    describe_counter!(
        "dispatch_circuit_rejections_total",
        "Calls rejected by an open circuit"
    );
    describe_counter!(
        "dispatch_rate_limit_rejections_total",
        "Messages rejected by a rate limiter"
    );
    describe_counter!("dispatch_retry_attempts_total", "Retries scheduled");
    describe_counter!(
        "dispatch_retries_exhausted_total",
        "Dispatches that ran out of retry attempts"
    );
    describe_counter!("dispatch_timeouts_total", "Dispatches that exceeded their deadline");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Records a completed dispatch.
///
/// `result` is `success`, `failed` or `error`; `code` is the problem or error
/// code (empty on success).
pub fn record_dispatch(message_type: &str, kind: &str, result: &str, code: &str, duration: Duration) {
    counter!(
        "dispatch_messages_total",
        "message_type" => message_type.to_string(),
        "kind" => kind.to_string(),
        "result" => result.to_string(),
        "code" => code.to_string()
    )
    .increment(1);

    histogram!(
        "dispatch_duration_seconds",
        "message_type" => message_type.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records a circuit state transition.
pub fn record_circuit_transition(circuit: &str, from: &'static str, to: &'static str) {
    counter!(
        "dispatch_circuit_transitions_total",
        "circuit" => circuit.to_string(),
        "from" => from,
        "to" => to
    )
    .increment(1);
}

/// Records a call rejected by an open circuit.
pub fn record_circuit_rejection(circuit: &str) {
    counter!(
        "dispatch_circuit_rejections_total",
        "circuit" => circuit.to_string()
    )
    .increment(1);
}

/// Records a rate limit rejection.
///
/// `scope` is `global` or `per_key`; the throttled key itself is logged, not
/// labelled.
pub fn record_rate_limit_rejection(scope: &'static str, algorithm: &'static str) {
    counter!(
        "dispatch_rate_limit_rejections_total",
        "scope" => scope,
        "algorithm" => algorithm
    )
    .increment(1);
}

/// Records a scheduled retry.
pub fn record_retry_attempt(message_type: &str, reason: &'static str) {
    counter!(
        "dispatch_retry_attempts_total",
        "message_type" => message_type.to_string(),
        "reason" => reason
    )
    .increment(1);
}

/// Records a dispatch that ran out of retry attempts.
pub fn record_retries_exhausted(message_type: &str) {
    counter!(
        "dispatch_retries_exhausted_total",
        "message_type" => message_type.to_string()
    )
    .increment(1);
}

/// Records a deadline exceeded.
pub fn record_timeout(message_type: &str) {
    counter!(
        "dispatch_timeouts_total",
        "message_type" => message_type.to_string()
    )
    .increment(1);
}

/// Guard that tracks a message in the in-flight gauge until dropped.
///
/// The gauge is decremented on every exit path, including cancellation and
/// unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    _private: (),
}

impl InFlightGuard {
    /// Creates a new guard and increments the in-flight gauge.
    #[must_use]
    pub fn new() -> Self {
        gauge!("dispatch_in_flight_messages").increment(1.0);
        Self { _private: () }
    }
}

impl Default for InFlightGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        gauge!("dispatch_in_flight_messages").decrement(1.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics() {
        assert!(init_metrics(&MetricsConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_address() {
        let config = MetricsConfig {
            enabled: true,
            addr: Some("not-an-address".to_string()),
        };
        assert!(matches!(
            init_metrics(&config),
            Err(TelemetryError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_record_functions_without_recorder() {
        record_dispatch("PlaceOrder", "action", "success", "", Duration::from_millis(5));
        record_circuit_transition("payments", "closed", "open");
        record_circuit_rejection("payments");
        record_rate_limit_rejection("global", "token_bucket");
        record_retry_attempt("PlaceOrder", "Transient");
        record_retries_exhausted("PlaceOrder");
        record_timeout("PlaceOrder");
        drop(InFlightGuard::new());
    }
}
