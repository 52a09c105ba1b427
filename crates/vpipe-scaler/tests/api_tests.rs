//! Scaling API tests against in-memory queue and batch backends.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use vpipe_models::BatchJob;
use vpipe_scaler::{
    create_router, AppState, Backends, BatchCompute, Backlog, QueueInspector, ScalerConfig, ScalerResult,
    ScalingController,
};

struct StaticInspector(Backlog);

#[async_trait]
impl QueueInspector for StaticInspector {
    async fn backlog(&self) -> ScalerResult<Backlog> {
        Ok(self.0)
    }
}

#[derive(Default)]
struct CountingBatch {
    submitted: Mutex<u32>,
}

#[async_trait]
impl BatchCompute for CountingBatch {
    async fn submit_worker(&self) -> ScalerResult<String> {
        let mut submitted = self.submitted.lock().unwrap();
        *submitted += 1;
        Ok(format!("job-{}", *submitted))
    }

    async fn list_active_jobs(&self) -> ScalerResult<Vec<BatchJob>> {
        Ok(Vec::new())
    }
}

fn enabled_app(depth: u64) -> (Router, Arc<CountingBatch>) {
    let batch = Arc::new(CountingBatch::default());
    let backends = Backends {
        inspector: Arc::new(StaticInspector(Backlog {
            depth,
            active_consumers: 0,
        })),
        batch: batch.clone(),
    };
    let controller = Arc::new(ScalingController::new(ScalerConfig::default(), Some(backends)));
    (create_router(AppState::new(controller, None)), batch)
}

fn disabled_app() -> Router {
    let controller = Arc::new(ScalingController::new(ScalerConfig::default(), None));
    create_router(AppState::new(controller, None))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8(body.to_vec()).unwrap())
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let (status, body) = send(disabled_app(), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["autoscaling_enabled"], false);
}

#[tokio::test]
async fn test_metrics_snapshot_is_camel_case() {
    let (status, body) = send(disabled_app(), get("/scaling/metrics")).await;
    assert_eq!(status, StatusCode::OK);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["queueDepth"], 0);
    assert_eq!(json["totalJobsSubmitted"], 0);
    assert_eq!(json["enabled"], false);
}

#[tokio::test]
async fn test_trigger_when_disabled() {
    let (status, body) = send(disabled_app(), post_json("/scaling/trigger", r#"{"workerCount": 2}"#)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["detail"], "Autoscaling is disabled");
}

#[tokio::test]
async fn test_trigger_validates_worker_count() {
    for count in [0, 101] {
        let (app, batch) = enabled_app(0);
        let body = format!(r#"{{"workerCount": {}}}"#, count);
        let (status, body) = send(app, post_json("/scaling/trigger", &body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("workerCount"));
        assert_eq!(*batch.submitted.lock().unwrap(), 0);
    }
}

#[tokio::test]
async fn test_trigger_caps_at_max_workers() {
    let (app, batch) = enabled_app(0);
    let (status, body) = send(app, post_json("/scaling/trigger", r#"{"workerCount": 25}"#)).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["requested"], 25);
    assert_eq!(json["submitted"], 10);
    assert_eq!(json["jobIds"].as_array().unwrap().len(), 10);
    assert_eq!(*batch.submitted.lock().unwrap(), 10);
}

#[tokio::test]
async fn test_check_runs_a_poll() {
    let (app, batch) = enabled_app(3);
    let (status, body) = send(app, post_json("/scaling/check", "")).await;
    assert_eq!(status, StatusCode::OK);

    let json: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["queueDepth"], 3);
    assert_eq!(json["lastScaleAction"]["kind"], "automatic");
    assert_eq!(*batch.submitted.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_check_when_disabled() {
    let (status, _) = send(disabled_app(), post_json("/scaling/check", "")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_status_is_plain_text() {
    let (status, body) = send(disabled_app(), get("/scaling/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.starts_with("Autoscaling: disabled"));
}

#[tokio::test]
async fn test_metrics_endpoint_without_recorder() {
    let (status, _) = send(disabled_app(), get("/metrics")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
