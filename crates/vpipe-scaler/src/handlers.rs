//! HTTP handlers for the scaling API.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use validator::Validate;

use vpipe_models::ScalingMetrics;

use crate::controller::TriggerOutcome;
use crate::error::{ScalerError, ScalerResult};
use crate::state::AppState;

/// Health response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub timestamp: String,
    pub autoscaling_enabled: bool,
}

/// Liveness probe.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
        autoscaling_enabled: state.controller.is_enabled(),
    })
}

pub async fn scaling_metrics(State(state): State<AppState>) -> Json<ScalingMetrics> {
    Json(state.controller.metrics().await)
}

pub async fn scaling_status(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        state.controller.status_summary().await,
    )
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    #[validate(range(min = 1, max = 100))]
    pub worker_count: u32,
}

/// Submit workers now, bypassing threshold and cooldown.
pub async fn trigger(
    State(state): State<AppState>,
    Json(request): Json<TriggerRequest>,
) -> ScalerResult<Json<TriggerOutcome>> {
    request
        .validate()
        .map_err(|e| ScalerError::validation(format!("workerCount must be between 1 and 100: {}", e)))?;
    Ok(Json(state.controller.trigger(request.worker_count).await?))
}

/// Run one poll now and return the resulting snapshot.
pub async fn check(State(state): State<AppState>) -> ScalerResult<Json<ScalingMetrics>> {
    if !state.controller.is_enabled() {
        return Err(ScalerError::Disabled);
    }
    state.controller.tick().await;
    Ok(Json(state.controller.metrics().await))
}

/// Prometheus exposition.
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    match &state.metrics_handle {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::NOT_FOUND, "metrics disabled".to_string()),
    }
}
