//! Prometheus metrics recording and endpoint.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return the handle used for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    Ok(PrometheusBuilder::new().install_recorder()?)
}

pub fn record_session_registered() {
    metrics::counter!("voxline_sessions_started_total").increment(1);
}

pub fn record_session_connected() {
    metrics::gauge!("voxline_sessions_active").increment(1.0);
}

/// Record a session leaving the gateway with its final task state.
pub fn record_session_closed(outcome: &str) {
    metrics::gauge!("voxline_sessions_active").decrement(1.0);
    let labels = [("outcome", outcome.to_string())];
    metrics::counter!("voxline_sessions_ended_total", &labels).increment(1);
}

pub fn record_interruptions(count: u64) {
    metrics::counter!("voxline_interruptions_total").increment(count);
}

pub fn record_stage_error(reason: &str) {
    let stage = reason.split_whitespace().next().unwrap_or("unknown").to_string();
    metrics::counter!("voxline_stage_errors_total", &[("stage", stage)]).increment(1);
}
