//! Health check handlers for receiver workers.
//!
//! This module provides reusable Axum handlers for:
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`), ready when every receiver is started
//! - Receiver monitoring (`/receivers`, `/receivers/{name}/errors`)
//! - Prometheus metrics (`/metrics`)

use crate::registry::ListenerRegistry;
use crate::run_state::RunState;
use crate::statistics::StatisticsSnapshot;
use crate::{metrics, ReceiverError};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<ListenerRegistry>,
    pub app_name: String,
    pub app_version: String,
}

impl HealthState {
    pub fn new(registry: Arc<ListenerRegistry>, app_name: impl Into<String>, app_version: impl Into<String>) -> Self {
        Self {
            registry,
            app_name: app_name.into(),
            app_version: app_version.into(),
        }
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Monitoring view of one receiver
#[derive(Debug, Serialize)]
pub struct ReceiverStatus {
    pub name: String,
    pub state: RunState,
    pub degraded: bool,
    pub threads: usize,
    pub statistics: StatisticsSnapshot,
}

/// Liveness probe handler.
///
/// Always returns OK if the server is running.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready once every registered receiver is `STARTED`.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let states = state.registry.run_states();
    let ready = !states.is_empty() && states.values().all(|s| *s == RunState::Started);
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (
        status,
        Json(json!({
            "status": if ready { "ready" } else { "not_ready" },
            "receivers": states,
        })),
    )
}

/// State, thread count and counters of every receiver.
pub async fn receivers_handler(State(state): State<HealthState>) -> Json<Vec<ReceiverStatus>> {
    let statuses = state
        .registry
        .names()
        .into_iter()
        .filter_map(|name| state.registry.get(&name))
        .map(|receiver| ReceiverStatus {
            name: receiver.name().to_string(),
            state: receiver.run_state(),
            degraded: receiver.is_degraded(),
            threads: receiver.current_thread_count(),
            statistics: receiver.statistics(),
        })
        .collect();
    Json(statuses)
}

/// Records in a receiver's error storage.
///
/// `GET /receivers/{name}/errors`
pub async fn quarantined_handler(
    State(state): State<HealthState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let receiver = state
        .registry
        .get(&name)
        .ok_or_else(|| (StatusCode::NOT_FOUND, Json(json!({ "error": "Receiver not found", "receiver": name }))))?;

    match receiver.quarantined_messages().await {
        Ok(messages) => Ok(Json(json!({
            "receiver": name,
            "count": messages.len(),
            "messages": messages,
        }))),
        Err(ReceiverError::Configuration(e)) => Err((StatusCode::NOT_FOUND, Json(json!({ "error": e })))),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// Create the health router.
///
/// - `/health`, `/healthz` - Liveness probe
/// - `/ready`, `/readyz` - Readiness probe
/// - `/receivers` - Receiver states and counters
/// - `/receivers/{name}/errors` - Quarantined messages
/// - `/metrics` - Prometheus metrics
pub fn health_router(state: HealthState) -> axum::Router {
    use axum::routing::get;

    axum::Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/receivers", get(receivers_handler))
        .route("/receivers/{name}/errors", get(quarantined_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
