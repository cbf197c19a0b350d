//! HTTP surface: Prometheus metrics and the probe endpoints

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use kube_reserved_lib::health::{AgentCondition, HealthRegistry, HealthReport};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// State the handlers read: the health registry plus the one knob an
/// operator hitting the probes by hand always wants to see.
#[derive(Clone)]
pub struct AppState {
    pub health: HealthRegistry,
    /// Whether the memory loop is writing the pod cgroup limit.
    pub enforcing: bool,
}

impl AppState {
    pub fn new(health: HealthRegistry, enforcing: bool) -> Self {
        Self { health, enforcing }
    }
}

#[derive(Serialize)]
struct HealthzBody {
    enforcing: bool,
    #[serde(flatten)]
    report: HealthReport,
}

/// Liveness. Only a stalled loop reports failure; skipped ticks are the
/// normal cost of a transient error and cost one period each.
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

/// Readiness: startup complete and neither loop stalled.
async fn readyz(State(state): State<Arc<AppState>>) -> Response {
    let readiness = state.health.readiness().await;
    let status = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(readiness)).into_response()
}

/// Prometheus text exposition of the node gauges.
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

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Bind the metrics port. Called before the loops start so a taken port is
/// fatal at startup, not a silent background failure.
pub async fn bind(port: u16) -> anyhow::Result<tokio::net::TcpListener> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind metrics port {}: {}", addr, e))?;
    info!(addr = %addr, "Metrics server listening");
    Ok(listener)
}

/// Serve the API on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<AppState>) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}
