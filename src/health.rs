//! `/healthz` and `/metrics` HTTP endpoint (spec §4.9).

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::metrics::Metrics;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Healthy,
    Degraded,
    Starting,
    ShuttingDown,
}

pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub metrics: Arc<Metrics>,
    pub shutting_down: std::sync::atomic::AtomicBool,
}

#[derive(Serialize)]
struct ServiceEntry {
    healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    uptime_sec: Option<u64>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: ServiceStatus,
    timestamp: chrono::DateTime<Utc>,
    services: std::collections::HashMap<String, ServiceEntry>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> std::io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "health/metrics endpoint listening");
    axum::serve(listener, app).await
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let degraded = state.supervisor.any_degraded().await;
    let shutting_down = state.shutting_down.load(std::sync::atomic::Ordering::Relaxed);

    let status = if shutting_down {
        ServiceStatus::ShuttingDown
    } else if degraded {
        ServiceStatus::Degraded
    } else {
        ServiceStatus::Healthy
    };

    let services = state
        .supervisor
        .status()
        .await
        .into_iter()
        .map(|(name, s)| {
            (
                name,
                ServiceEntry { healthy: s.healthy, last_error: s.last_error, uptime_sec: s.uptime_sec },
            )
        })
        .collect();

    let body = HealthResponse { status, timestamp: Utc::now(), services };

    let code = if status == ServiceStatus::Degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (code, axum::Json(body))
}

async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.encode_text(),
    )
}
