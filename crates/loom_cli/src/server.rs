//! HTTP API over the orchestrator, iteration controller and preview supervisor.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use loom_core::{
    CoreError, GenerationOptions, IterationController, IterationOptions, Orchestrator,
};
use loom_runner::{PreviewSupervisor, RunnerError};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
    pub iterations: IterationController,
    pub supervisor: PreviewSupervisor,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, supervisor: PreviewSupervisor) -> Self {
        Self {
            iterations: IterationController::new(orchestrator.clone()),
            orchestrator,
            supervisor,
        }
    }
}

pub type SharedState = Arc<AppState>;

/// Configuration for the HTTP server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests from any origin
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            cors: false,
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub description: String,
    #[serde(flatten)]
    pub options: GenerationOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IterateRequest {
    pub feedback: String,
    pub model: Option<String>,
    #[serde(default)]
    pub regenerate_code: bool,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PreviewRequest {
    pub model: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UnloadNotice {
    session_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"error": message}))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(_) => ApiError::BadRequest(e.to_string()),
            CoreError::SessionNotFound(_) => ApiError::NotFound(e.to_string()),
            CoreError::SessionBusy(_) => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<RunnerError> for ApiError {
    fn from(e: RunnerError) -> Self {
        match e {
            RunnerError::NotFound(_) | RunnerError::ProjectNotFound(_) => {
                ApiError::NotFound(e.to_string())
            }
            RunnerError::AlreadyRunning(_) => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/generate", post(submit_generation))
        .route("/api/generate/{id}", get(generation_status))
        .route("/api/generate/{id}/iterate", post(iterate))
        .route("/api/preview/stop_on_exit", post(stop_on_exit))
        .route("/api/preview/stop_all", post(stop_all))
        .route("/api/preview/{id}", get(preview_status))
        .route("/api/preview/{id}/start", post(start_preview))
        .route("/api/preview/{id}/stop", post(stop_preview))
        .route("/api/preview/{id}/restart", post(restart_preview))
        .route("/health", get(health_check))
}

pub fn build_router(state: SharedState, cors: bool) -> Router {
    let app = api_router().with_state(state);
    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn submit_generation(
    State(state): State<SharedState>,
    Json(req): Json<GenerateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Projects created over HTTP always live under the output root
    let options = GenerationOptions {
        target_dir: None,
        ..req.options
    };
    let id = state.orchestrator.submit(&req.description, options)?;
    Ok((StatusCode::ACCEPTED, Json(json!({"sessionId": id}))))
}

async fn generation_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.status(&id)?))
}

async fn iterate(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<IterateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.iterations.continue_iteration(
        &id,
        &req.feedback,
        req.model.as_deref(),
        IterationOptions {
            regenerate_code: req.regenerate_code,
        },
    )?;
    Ok((StatusCode::ACCEPTED, Json(json!({"sessionId": id}))))
}

/// Model for automatic preview fixes: explicit request, then the session's.
fn preview_model(state: &AppState, id: &str, requested: Option<String>) -> Option<String> {
    requested.or_else(|| {
        state
            .orchestrator
            .session(id)
            .ok()
            .map(|s| s.model(&state.orchestrator.config().default_model).to_string())
    })
}

/// Failed starts still answer with the preview snapshot so clients can show the logs.
fn start_failure(state: &AppState, id: &str, e: RunnerError) -> Response {
    match e {
        RunnerError::AlreadyRunning(_)
        | RunnerError::NotFound(_)
        | RunnerError::ProjectNotFound(_) => ApiError::from(e).into_response(),
        other => {
            warn!("Preview {} failed: {}", id, other);
            match state.supervisor.status(id) {
                Ok(snapshot) => (StatusCode::UNPROCESSABLE_ENTITY, Json(snapshot)).into_response(),
                Err(_) => ApiError::Internal(other.to_string()).into_response(),
            }
        }
    }
}

async fn start_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<PreviewRequest>>,
) -> Result<Response, ApiError> {
    let session = state.orchestrator.session(&id)?;
    let requested = body.map(|Json(b)| b).unwrap_or_default().model;
    let model = preview_model(&state, &id, requested);

    match state
        .supervisor
        .start(&id, &session.target_dir, model.as_deref())
        .await
    {
        Ok(snapshot) => Ok(Json(snapshot).into_response()),
        Err(e) => Ok(start_failure(&state, &id, e)),
    }
}

async fn restart_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<PreviewRequest>>,
) -> Result<Response, ApiError> {
    let requested = body.map(|Json(b)| b).unwrap_or_default().model;
    let model = preview_model(&state, &id, requested);

    match state.supervisor.restart(&id, model.as_deref()).await {
        Ok(snapshot) => Ok(Json(snapshot).into_response()),
        Err(e) => Ok(start_failure(&state, &id, e)),
    }
}

async fn stop_preview(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.supervisor.stop(&id).await?;
    Ok(Json(json!({"sessionId": id, "result": outcome})))
}

async fn preview_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.supervisor.status(&id)?))
}

/// Page-unload beacon. Browsers may send it as text/plain, so the body is
/// parsed by hand, and the answer is always 204.
async fn stop_on_exit(State(state): State<SharedState>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<UnloadNotice>(&body) {
        Ok(notice) => state.supervisor.notify_unload(&notice.session_id),
        Err(e) => warn!("Ignoring malformed unload notice: {}", e),
    }
    StatusCode::NO_CONTENT
}

async fn stop_all(State(state): State<SharedState>) -> impl IntoResponse {
    let stopped = state.supervisor.shutdown_all().await;
    Json(json!({"stopped": stopped}))
}

// ── Server ────────────────────────────────────────────────────────────

/// Serve until Ctrl+C, then stop every preview.
pub async fn start_server(config: ServerConfig, state: SharedState) -> Result<()> {
    let reaper = state.supervisor.spawn_idle_reaper();
    let app = build_router(state.clone(), config.cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!("AppLoom API listening on http://{}", local_addr);
    println!("🧵 AppLoom running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    let stopped = state.supervisor.shutdown_all().await;
    println!("Server shut down gracefully ({} preview(s) stopped).", stopped);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
