// ABOUTME: Prometheus metrics registration and thin recording helpers
// ABOUTME: Counters and gauges for request lifecycle, job execution, and the HTTP surface

use anyhow::{Context, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering /metrics.
/// Call once at process startup.
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

pub fn record_request_created() {
    counter!("crosswire_requests_created_total").increment(1);
}

/// Terminal transition by final status ("resolved", "timeout", "cancelled", "orphaned")
pub fn record_request_finished(status: &str) {
    counter!("crosswire_requests_finished_total", "status" => status.to_string()).increment(1);
}

pub fn record_request_rejected(reason: &str) {
    counter!("crosswire_requests_rejected_total", "reason" => reason.to_string()).increment(1);
}

pub fn set_pending_requests(count: u64) {
    gauge!("crosswire_pending_requests").set(count as f64);
}

pub fn record_job_executed(status: &str) {
    counter!("crosswire_jobs_executed_total", "status" => status.to_string()).increment(1);
}

pub fn record_job_duration(seconds: f64) {
    histogram!("crosswire_job_duration_seconds").record(seconds);
}

pub fn set_scheduled_jobs(count: u64) {
    gauge!("crosswire_scheduled_jobs").set(count as f64);
}

pub fn record_http_request(route: &str, outcome: &str) {
    counter!(
        "crosswire_http_requests_total",
        "route" => route.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
