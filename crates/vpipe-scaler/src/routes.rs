//! Scaling API routes.

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::handlers::{check, health, metrics, scaling_metrics, scaling_status, trigger};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    let scaling_routes = Router::new()
        .route("/scaling/metrics", get(scaling_metrics))
        .route("/scaling/status", get(scaling_status))
        .route("/scaling/trigger", post(trigger))
        .route("/scaling/check", post(check));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .merge(scaling_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
