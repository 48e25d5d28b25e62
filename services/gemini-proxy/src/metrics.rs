//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `mode`
//! - `proxy_request_duration_seconds` (histogram): label `status`
//! - `proxy_upstream_errors_total` (counter): label `error_type`
//! - `proxy_upstream_attempts_total` (counter): label `result`
//!
//! The pool crate records `pool_credentials_disabled_total`,
//! `pool_credentials_reactivated_total` and the `pool_credentials_active` gauge.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets in seconds. The upper end covers the default 180 s
/// upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 180.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("proxy_request_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `proxy_request_duration_seconds` gets explicit buckets so it renders as a
/// histogram (`_bucket` lines) rather than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed proxy request. `mode` is `buffered`, `stream` or `none`
/// for requests rejected before reaching the upstream.
pub fn record_request(status: u16, mode: &'static str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!("proxy_requests_total", "status" => status_str.clone(), "mode" => mode)
        .increment(1);
    metrics::histogram!("proxy_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

/// Record a retryable upstream failure with a classification label.
pub fn record_upstream_error(error_type: &'static str) {
    metrics::counter!("proxy_upstream_errors_total", "error_type" => error_type).increment(1);
}

/// Record one upstream attempt by outcome (`success`, `terminal`, `retryable`).
pub fn record_attempt(result: &'static str) {
    metrics::counter!("proxy_upstream_attempts_total", "result" => result).increment(1);
}
