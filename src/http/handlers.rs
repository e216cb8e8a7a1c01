use super::state::AppState;
use crate::server::SessionSnapshot;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Response Types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub active: Vec<SessionSnapshot>,
    pub closed: Vec<SessionSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /sessions
/// List active and closed sessions
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.server.active_sessions().await;
    let closed = state.server.closed_sessions().await;
    debug!("Listing {} active, {} closed sessions", active.len(), closed.len());

    (StatusCode::OK, Json(SessionListResponse { active, closed })).into_response()
}

/// GET /sessions/:session_id
/// Get one session, active or closed
pub async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.server.session(&session_id).await {
        Some(snapshot) => (StatusCode::OK, Json(snapshot)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session {} not found", session_id),
            }),
        )
            .into_response(),
    }
}

/// GET /health
/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}
