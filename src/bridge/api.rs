use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::git::Vcs;
use super::history::PromptHistory;
use super::queue::Orchestrator;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub ws_tx: broadcast::Sender<String>,
    pub history: Arc<PromptHistory>,
    pub vcs: Arc<dyn Vcs>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

/// Body of the auto-merge endpoint, posted by the external webhook relay
/// when a preview deployment succeeds and the relay can reach the bridge
/// directly instead of waiting for the deployment poll.
#[derive(Deserialize)]
pub struct AutoMergeRequest {
    pub branch_name: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub deployment_url: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/auto-merge", post(auto_merge))
        .route("/api/queue", get(queue_status))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn queue_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let snapshot = state.orchestrator.snapshot();
    Json(serde_json::to_value(snapshot).unwrap_or_else(|_| serde_json::json!({})))
}

async fn auto_merge(
    State(state): State<SharedState>,
    Json(req): Json<AutoMergeRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.branch_name.trim().is_empty() {
        return Err(ApiError::BadRequest("Missing branch_name".to_string()));
    }
    eprintln!(
        "[api] auto-merge requested for {} (agent: {})",
        req.branch_name,
        req.agent_id.as_deref().unwrap_or("unknown")
    );
    if let Some(url) = &req.deployment_url {
        eprintln!("[api] deployment: {}", url);
    }

    match state.vcs.merge_to_trunk(&req.branch_name).await {
        Ok(()) => Ok(Json(serde_json::json!({
            "success": true,
            "message": "Auto-merge completed",
        }))),
        Err(e) => {
            eprintln!("[api] auto-merge failed: {:#}", e);
            Err(ApiError::Internal(e.to_string()))
        }
    }
}
