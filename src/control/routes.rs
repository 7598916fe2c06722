//! Control-plane HTTP routes.
//!
//! Only the runner-facing RPC surface plus health and instance
//! reporting live here; user-facing session CRUD beyond creation is an
//! API-gateway concern.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::controller::{Controller, NewSession};
use crate::protocol::{ModelInstanceState, TaskResponse};
use crate::session::{Session, SessionFilter, SessionMode, SessionType};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<Controller>,
}

/// Create the control-plane router.
pub fn create_router(state: AppState) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sessions", post(create_session))
        .route("/api/v1/sessions/{session_id}", get(get_session))
        .route("/api/v1/runner/next", post(next_request))
        .route("/api/v1/runner/response", post(handle_response))
        .route("/api/v1/runner/state", post(report_state))
        .route("/api/v1/instances", get(list_instances))
        .layer(trace_layer)
        .with_state(state)
}

/// Request body for session creation.
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub owner: String,
    #[serde(default = "default_mode")]
    pub mode: SessionMode,
    #[serde(default = "default_type", rename = "type")]
    pub session_type: SessionType,
    pub model: String,
    pub message: String,
    #[serde(default)]
    pub adapter_dir: Option<String>,
}

fn default_mode() -> SessionMode {
    SessionMode::Create
}

fn default_type() -> SessionType {
    SessionType::Text
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<ErrorBody>) {
    tracing::error!("request failed: {:?}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let depth = state.controller.queue_depth().await;
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_depth": depth,
    }))
}

async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<Json<Session>, (StatusCode, Json<ErrorBody>)> {
    let session = state
        .controller
        .add_session(NewSession {
            owner: req.owner,
            mode: req.mode,
            session_type: req.session_type,
            model: req.model,
            message: req.message,
            adapter_dir: req.adapter_dir,
        })
        .await
        .map_err(internal_error)?;

    Ok(Json(session))
}

async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, (StatusCode, Json<ErrorBody>)> {
    let session = state
        .controller
        .get_session(&session_id)
        .await
        .map_err(internal_error)?;

    match session {
        Some(session) => Ok(Json(session)),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("session not found: {}", session_id),
            }),
        )),
    }
}

/// Runner work poll: 200 with a request, or 204 when nothing matches.
async fn next_request(
    State(state): State<AppState>,
    Json(filter): Json<SessionFilter>,
) -> Result<axum::response::Response, (StatusCode, Json<ErrorBody>)> {
    let next = state
        .controller
        .next_request(&filter)
        .await
        .map_err(internal_error)?;

    match next {
        Some(request) => Ok(Json(request).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn handle_response(
    State(state): State<AppState>,
    Json(response): Json<TaskResponse>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    state
        .controller
        .handle_response(response)
        .await
        .map_err(internal_error)?;

    Ok(StatusCode::OK)
}

async fn report_state(
    State(state): State<AppState>,
    Json(snapshot): Json<ModelInstanceState>,
) -> StatusCode {
    state.controller.report_instance_state(snapshot).await;
    StatusCode::OK
}

async fn list_instances(State(state): State<AppState>) -> Json<Vec<ModelInstanceState>> {
    Json(state.controller.instance_states().await)
}
