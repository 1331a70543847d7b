//! Metrics collection and exposition.
//!
//! # Metrics
//! - `guard_calls_total` (counter): gateway calls by method, outcome
//! - `guard_call_duration_seconds` (histogram): end-to-end call latency
//! - `guard_retries_total` (counter): extra attempts by method, error code
//! - `guard_rate_limited_total` (counter): limiter waits and timeouts
//! - `guard_dead_letters_total` (counter): items moved to the dead-letter store
//! - `guard_audit_failures_total` (counter): audit entries that could not be written
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Duration;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder with an HTTP scrape endpoint on `addr`.
///
/// Must be called inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// One finished gateway call.
pub fn record_call(method: &str, outcome: &str, elapsed: Duration) {
    ::metrics::counter!(
        "guard_calls_total",
        "method" => method.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    ::metrics::histogram!("guard_call_duration_seconds", "method" => method.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_retry(method: &str, code: &str) {
    ::metrics::counter!(
        "guard_retries_total",
        "method" => method.to_string(),
        "code" => code.to_string()
    )
    .increment(1);
}

/// `reason` is `wait` or `timeout`.
pub fn record_rate_limited(reason: &'static str) {
    ::metrics::counter!("guard_rate_limited_total", "reason" => reason).increment(1);
}

pub fn record_dead_letter(event: &str) {
    ::metrics::counter!("guard_dead_letters_total", "event" => event.to_string()).increment(1);
}

pub fn record_audit_failure() {
    ::metrics::counter!("guard_audit_failures_total").increment(1);
}
