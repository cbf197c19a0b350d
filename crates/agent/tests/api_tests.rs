//! Integration tests for the agent API endpoints

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kube_reserved_lib::health::{AgentCondition, HealthRegistry, HealthReport, Task};
use kube_reserved_lib::observability::NodeMetrics;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// The bin crate's modules are not importable from integration tests, so the
// handlers are mirrored here against the same health registry.

#[derive(Clone)]
struct AppState {
    health: HealthRegistry,
    enforcing: bool,
}

#[derive(Serialize)]
struct HealthzBody {
    enforcing: bool,
    #[serde(flatten)]
    report: HealthReport,
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    let report = state.health.health().await;
    let status = match report.condition {
        AgentCondition::Failing => StatusCode::SERVICE_UNAVAILABLE,
        AgentCondition::Ok | AgentCondition::Degraded => StatusCode::OK,
    };
    (
        status,
        Json(HealthzBody {
            enforcing: state.enforcing,
            report,
        }),
    )
        .into_response()
}

async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

async fn metrics() -> Response {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics encoding failed: {}", e),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

fn test_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn setup_app(registry: HealthRegistry, enforcing: bool) -> (Router, Arc<AppState>) {
    // Registers the gauge set so /metrics has content.
    let _metrics = NodeMetrics::new();

    let state = Arc::new(AppState {
        health: registry,
        enforcing,
    });
    (test_router(state.clone()), state)
}

fn registry() -> HealthRegistry {
    HealthRegistry::new(Duration::from_secs(5), Duration::from_secs(20))
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_reports_ok_and_enforcement_flag() {
    let (app, _state) = setup_app(registry(), true);

    let (status, body) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["condition"], "ok");
    assert_eq!(body["enforcing"], true);
    assert_eq!(body["memory_loop"]["condition"], "ok");
    assert_eq!(body["slow_loop"]["condition"], "ok");
    // No sink wired, no apply section.
    assert!(body.get("apply").is_none());
}

#[tokio::test]
async fn test_healthz_stays_200_on_skipped_ticks() {
    let reg = registry();
    reg.tick_failed(Task::MemoryLoop, "cgroup read failed").await;
    let (app, _state) = setup_app(reg, false);

    let (status, body) = get_json(app, "/healthz").await;

    // A skipped tick costs one period; the agent is degraded, not dead.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["condition"], "degraded");
    assert_eq!(body["memory_loop"]["last_error"], "cgroup read failed");
    assert_eq!(body["enforcing"], false);
}

#[tokio::test]
async fn test_healthz_returns_503_when_a_loop_stalls() {
    // 1 ms memory cadence with no ticks: the stall window expires at once.
    let reg = HealthRegistry::new(Duration::from_millis(1), Duration::from_secs(20));
    tokio::time::sleep(Duration::from_millis(30)).await;
    let (app, _state) = setup_app(reg, false);

    let (status, body) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["condition"], "failing");
    assert_eq!(body["memory_loop"]["condition"], "failing");
}

#[tokio::test]
async fn test_healthz_surfaces_the_reservation_sink() {
    let reg = registry();
    reg.enable_apply("kubelet-config-file").await;
    reg.tick_failed(Task::Apply, "deadline exceeded").await;
    let (app, _state) = setup_app(reg, false);

    let (status, body) = get_json(app, "/healthz").await;

    // A dead sink degrades but never kills liveness.
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["condition"], "degraded");
    assert_eq!(body["apply"]["sink"], "kubelet-config-file");
    assert_eq!(body["apply"]["last_error"], "deadline exceeded");
}

#[tokio::test]
async fn test_readyz_returns_503_until_ready() {
    let (app, _state) = setup_app(registry(), false);

    let (status, body) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let reg = registry();
    reg.set_ready(true).await;
    let (app, _state) = setup_app(reg, false);

    let (status, body) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ready"], true);
}

#[tokio::test]
async fn test_readyz_returns_503_when_ready_but_stalled() {
    let reg = HealthRegistry::new(Duration::from_millis(1), Duration::from_secs(20));
    reg.set_ready(true).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let (app, _state) = setup_app(reg, false);

    let (status, body) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason"], "memory loop stalled");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_node_gauges() {
    let (app, _state) = setup_app(registry(), false);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let metrics_text = String::from_utf8(body.to_vec()).unwrap();

    assert!(metrics_text.contains("node_memory_MemTotal"));
    assert!(metrics_text.contains("kubelet_target_reserved_memory_bytes"));
    assert!(metrics_text.contains("node_cpu_usage_percent"));
    assert!(metrics_text.contains("kubelet_target_reserved_disk_bytes"));
}
