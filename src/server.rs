//! HTTP surface of the capture service
//!
//! `POST /api/screenshot` starts a job, `GET /api/progress/:id` streams its
//! progress as server-sent events and `GET /api/jobs/:id` returns a snapshot.
//! Finished artifacts are served as static files under the configured prefix.

use crate::{CaptureError, Config, JobId, JobRegistry, JobSnapshot};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::{cors::CorsLayer, services::ServeDir, trace::TraceLayer};

#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistry,
    /// Present when a Prometheus recorder is installed
    pub metrics: Option<PrometheusHandle>,
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            CaptureError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            CaptureError::JobNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            CaptureError::AlreadySubscribed(_) => (StatusCode::CONFLICT, "ALREADY_SUBSCRIBED"),
            other => {
                tracing::error!("Request failed: {other}");
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string()
            }
        }));

        (status, body).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: JobId,
    pub message: String,
}

pub fn build_router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/screenshot", post(submit_handler))
        .route("/api/progress/:job_id", get(progress_handler))
        .route("/api/jobs/:job_id", get(job_handler))
        .with_state(state)
        .nest_service(
            &config.artifacts_url_prefix,
            ServeDir::new(&config.artifacts_dir),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// POST /api/screenshot
async fn submit_handler(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, CaptureError> {
    let url = request.url.unwrap_or_default();
    let job_id = state.registry.submit(&url)?;

    Ok(Json(SubmitResponse {
        job_id,
        message: "Screenshot capture started".to_string(),
    }))
}

/// GET /api/progress/:job_id
async fn progress_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, CaptureError> {
    let stream = state.registry.subscribe(&JobId::from(job_id))?;
    let events = stream.map(|event| Event::default().json_data(event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// GET /api/jobs/:job_id
async fn job_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobSnapshot>, CaptureError> {
    let snapshot = state.registry.snapshot(&JobId::from(job_id))?;
    Ok(Json(snapshot))
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "sitesnap",
        "active_jobs": state.registry.active_jobs()
    }))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (StatusCode::OK, handle.render()).into_response(),
        None => (StatusCode::NOT_FOUND, "metrics recorder not installed").into_response(),
    }
}
