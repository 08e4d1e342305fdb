//! Prometheus metrics exposition
//!
//! - `chat_requests_total` (counter): labels `status`, `model`
//! - `chat_request_duration_seconds` (histogram): label `status`
//! - `upstream_errors_total` (counter): label `error_type`
//! - `credential_failovers_total` (counter): label `reason`
//!
//! `cookie_pool_penalties_total` is emitted by the pool itself.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

const DURATION_METRIC: &str = "chat_request_duration_seconds";

/// Streams can stay open for minutes, so buckets reach well past a minute.
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Counters surfaced by `/health`, shared with the chat handler.
#[derive(Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Record a finished chat request.
pub fn record_request(status: u16, model: &str, duration_secs: f64) {
    let status = status.to_string();
    metrics::counter!("chat_requests_total", "status" => status.clone(), "model" => model.to_string())
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "status" => status).record(duration_secs);
}

pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Record a move to another credential after an invalid-session or rate-limit signal.
pub fn record_failover(reason: &str) {
    metrics::counter!("credential_failovers_total", "reason" => reason.to_string()).increment(1);
}
