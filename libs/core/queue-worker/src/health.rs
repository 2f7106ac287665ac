//! Health and admin endpoints for queue workers.
//!
//! - `GET /health`: liveness
//! - `GET /ready`: broker reachability plus any registered [`ReadinessCheck`]s
//! - `GET /metrics`: Prometheus text format
//! - `GET /admin/dlq`: on-demand DLQ depth check
//! - `POST /admin/dlq/reprocess`: resubmit dead-lettered messages matching a filter

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broker::QueueBroker;
use crate::dlq::{DlqMonitor, DlqReprocessor, ReprocessFilter};
use crate::metrics;

/// A dependency that must be reachable before the worker reports ready
#[async_trait]
pub trait ReadinessCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), String>;
}

/// Shared state for health and admin endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub broker: Arc<dyn QueueBroker>,
    pub queue_name: String,
    pub monitor: DlqMonitor,
    pub reprocessor: DlqReprocessor,
    pub app_name: String,
    pub app_version: String,
    checks: Vec<Arc<dyn ReadinessCheck>>,
}

impl HealthState {
    pub fn new(
        broker: Arc<dyn QueueBroker>,
        monitor: DlqMonitor,
        reprocessor: DlqReprocessor,
        app_name: impl Into<String>,
        app_version: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            queue_name: monitor.queue_name().to_string(),
            monitor,
            reprocessor,
            app_name: app_name.into(),
            app_version: app_version.into(),
            checks: Vec::new(),
        }
    }

    pub fn with_check(mut self, check: Arc<dyn ReadinessCheck>) -> Self {
        self.checks.push(check);
        self
    }
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler. Always OK while the server runs.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
pub async fn ready_handler(State(state): State<HealthState>) -> (StatusCode, Json<Value>) {
    let broker_check = async {
        state
            .broker
            .runtime_properties(&state.queue_name)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    };
    let extra = join_all(state.checks.iter().map(|c| c.check()));
    let (broker_result, extra_results) = tokio::join!(broker_check, extra);

    let mut checks = Map::new();
    let mut all_ok = true;
    let names = std::iter::once("broker").chain(state.checks.iter().map(|c| c.name()));
    let results = std::iter::once(broker_result).chain(extra_results);

    for (name, result) in names.zip(results) {
        match result {
            Ok(()) => {
                checks.insert(name.to_string(), json!("ok"));
            }
            Err(e) => {
                error!(check = %name, error = %e, "Readiness check failed");
                checks.insert(name.to_string(), json!(format!("error: {e}")));
                all_ok = false;
            }
        }
    }

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if all_ok { "ready" } else { "not_ready" },
            "checks": checks,
        })),
    )
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics::render_metrics(),
    )
}

/// `GET /admin/dlq`
pub async fn dlq_check_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.monitor.check().await {
        Ok(alert) => Ok(Json(alert)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// `POST /admin/dlq/reprocess`
///
/// Body is a [`ReprocessFilter`]; `{}` reprocesses up to 100 messages unfiltered.
pub async fn dlq_reprocess_handler(
    State(state): State<HealthState>,
    Json(filter): Json<ReprocessFilter>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    if let (Some(from), Some(to)) = (filter.from_date, filter.to_date)
        && from >= to
    {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "fromDate must be before toDate" })),
        ));
    }

    info!(queue = %state.queue_name, "DLQ reprocess requested");
    match state.reprocessor.reprocess(&filter).await {
        Ok(result) => Ok(Json(result)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Router with health, metrics and DLQ admin endpoints.
pub fn admin_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq", get(dlq_check_handler))
        .route("/admin/dlq/reprocess", post(dlq_reprocess_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
