//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use satellite_session::ShutdownOutcome;

/// Install the Prometheus metrics recorder and return the handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}

/// Record a new WebSocket connection.
pub fn record_ws_connect() {
    metrics::gauge!("ws_connections_active").increment(1.0);
}

/// Record a WebSocket disconnection.
pub fn record_ws_disconnect() {
    metrics::gauge!("ws_connections_active").decrement(1.0);
}

/// Record a WS method request with its duration.
pub fn record_request(method: &str, duration_secs: f64) {
    let labels = [("method", method.to_string())];
    metrics::counter!("ws_requests_total", &labels).increment(1);
    metrics::histogram!("ws_request_duration_seconds", &labels).record(duration_secs);
}

/// Record a pipeline run starting.
pub fn record_run_started() {
    metrics::counter!("pipeline_runs_started_total").increment(1);
}

/// Record how a replaced run shut down.
pub fn record_run_replaced(outcome: ShutdownOutcome) {
    let outcome = match outcome {
        ShutdownOutcome::Drained => "drained",
        ShutdownOutcome::Cancelled => "cancelled",
    };
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("pipeline_runs_replaced_total", &labels).increment(1);
}

/// Record an error of a given kind.
pub fn record_error(kind: &str) {
    let labels = [("kind", kind.to_string())];
    metrics::counter!("errors_total", &labels).increment(1);
}
