//! Prometheus metrics for the controller.

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{ScalerError, ScalerResult};

/// Metric names as constants for consistency.
pub mod names {
    pub const QUEUE_DEPTH: &str = "vpipe_scaler_queue_depth";
    pub const ACTIVE_CONSUMERS: &str = "vpipe_scaler_active_consumers";
    pub const BATCH_JOBS_RUNNING: &str = "vpipe_scaler_batch_jobs_running";
    pub const BATCH_JOBS_PENDING: &str = "vpipe_scaler_batch_jobs_pending";
    pub const JOBS_SUBMITTED_TOTAL: &str = "vpipe_scaler_jobs_submitted_total";
    pub const POLL_ERRORS_TOTAL: &str = "vpipe_scaler_poll_errors_total";
}

/// Install the Prometheus recorder; the handle renders `/metrics`.
pub fn init_metrics() -> ScalerResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| ScalerError::config(format!("Failed to install Prometheus recorder: {}", e)))
}

pub fn set_observed(depth: u64, consumers: u32, running: u32, pending: u32) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
    gauge!(names::ACTIVE_CONSUMERS).set(consumers as f64);
    gauge!(names::BATCH_JOBS_RUNNING).set(running as f64);
    gauge!(names::BATCH_JOBS_PENDING).set(pending as f64);
}

pub fn record_submitted(kind: &'static str, count: u32) {
    counter!(names::JOBS_SUBMITTED_TOTAL, "kind" => kind).increment(u64::from(count));
}

pub fn record_poll_error() {
    counter!(names::POLL_ERRORS_TOTAL).increment(1);
}
