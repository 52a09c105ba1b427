//! Application state.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::controller::ScalingController;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ScalingController>,
    pub metrics_handle: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(controller: Arc<ScalingController>, metrics_handle: Option<PrometheusHandle>) -> Self {
        Self {
            controller,
            metrics_handle,
        }
    }
}
