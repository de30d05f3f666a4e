//! HTTP API: health probes, Prometheus metrics and operator introspection

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use tracing::info;

use daemon_lib::health::{ComponentStatus, HealthRegistry};
use daemon_lib::service::NetworkService;

/// Shared application state
pub struct AppState {
    pub svc: Arc<NetworkService>,
    pub health: HealthRegistry,
}

impl AppState {
    pub fn new(svc: Arc<NetworkService>, health: HealthRegistry) -> Self {
        Self { svc, health }
    }
}

/// Health check - 200 while operational, 503 once a component failed
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health.health().await;
    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

/// Readiness check - 200 once startup wiring completed
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness().await;
    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(readiness))
}

/// Prometheus metrics
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Three-way resource mapping dump for `podnetctl mapping`
async fn mapping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.svc.resource_mapping().await {
        Ok(mapping) => (StatusCode::OK, Json(mapping)).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
    }
}

/// Daemon configuration and per-pod resource bindings
async fn config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.svc.snapshot())
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/mapping", get(mapping))
        .route("/config", get(config))
        .with_state(state)
}

pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting http api");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
