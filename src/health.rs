//! Plain-HTTP admin listener: liveness and Prometheus metrics.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub provider: &'static str,
    pub transports: Transports,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Transports {
    pub http: bool,
    pub ssh: bool,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AdminState {
    pub metrics: MetricsRegistry,
    pub provider: &'static str,
    pub transports: Transports,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  The gateway holds no external connections of its own, so
/// being able to answer is the whole check.
async fn health_handler(State(state): State<Arc<AdminState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider: state.provider,
        transports: state.transports,
    })
}

/// `GET /metrics` in the OpenMetrics text format.
async fn metrics_handler(State(state): State<Arc<AdminState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub fn create_router(state: AdminState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(Arc::new(state))
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

pub async fn bind_admin(listen: &str) -> Result<TcpListener> {
    TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind admin listener on {listen}"))
}

pub async fn serve_admin(
    listener: TcpListener,
    state: AdminState,
    shutdown: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr().context("admin listener has no address")?;
    info!(address = %addr, "admin server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("admin server error")
}
