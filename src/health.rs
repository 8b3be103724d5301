//! Health and metrics HTTP endpoint: GET /healthz (JSON) and GET /metrics (Prometheus text).
//!
//! /healthz always answers 200 while the process runs; the body carries queue depth and
//! connection counts so operators can spot a stalled sink.

use crate::metrics;
use crate::server::ServerContext;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Shared state for the health handler.
pub struct HealthState {
    pub server: Arc<ServerContext>,
    pub started_at: Instant,
}

#[derive(Debug, Serialize)]
pub struct HealthBody {
    pub version: String,
    pub uptime_secs: f64,
    pub queue_depth: u64,
    pub durable: bool,
    pub connections: i64,
    pub records_total: u64,
}

fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub fn build_health_body(state: &HealthState) -> HealthBody {
    let queue = state.server.queue();
    HealthBody {
        version: version(),
        uptime_secs: state.started_at.elapsed().as_secs_f64(),
        queue_depth: queue.depth(),
        durable: queue.is_durable(),
        connections: state.server.connections(),
        records_total: state.server.counters().records_total(),
    }
}

/// Handler for GET /healthz: 200 + detailed JSON.
pub async fn healthz_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = build_health_body(state.as_ref());
    (
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        axum::Json(body),
    )
}

/// Handler for GET /metrics. Refreshes the queue depth gauge before encoding.
pub async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    metrics::set_queue_depth(state.server.queue().depth());
    (
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        metrics::encode(),
    )
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Serve until `cancel` fires.
pub async fn serve(listener: TcpListener, state: Arc<HealthState>, cancel: CancellationToken) {
    let app = router(state);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "metrics server error");
    }
}
