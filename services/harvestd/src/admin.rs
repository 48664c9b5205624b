//! Admin API for pool inspection and recovery
//!
//! Endpoints:
//! - GET  /admin/pools                 - session and egress pool health
//! - GET  /admin/sessions              - per-session counters and status
//! - POST /admin/sessions/reset        - revive every retired session
//! - POST /admin/sessions/{id}/reset   - revive one session

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tracing::{info, warn};

use identity_pool::IdentityPool;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pools: Arc<IdentityPool>,
}

impl AdminState {
    pub fn new(pools: Arc<IdentityPool>) -> Self {
        Self { pools }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/pools", get(pool_status))
        .route("/admin/sessions", get(list_sessions))
        .route("/admin/sessions/reset", post(reset_all_sessions))
        .route("/admin/sessions/{id}/reset", post(reset_session))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/pools
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    json_response(StatusCode::OK, state.pools.health().await)
}

/// GET /admin/sessions. Never exposes tokens.
async fn list_sessions(State(state): State<AdminState>) -> impl IntoResponse {
    let health = state.pools.sessions().health().await;
    let sessions = health
        .get("sessions")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json_response(StatusCode::OK, serde_json::json!({ "sessions": sessions }))
}

/// POST /admin/sessions/reset
async fn reset_all_sessions(State(state): State<AdminState>) -> impl IntoResponse {
    state.pools.sessions().reset_all().await;
    let total = state.pools.sessions().len().await;
    info!(sessions = total, "all sessions reset via admin API");
    json_response(StatusCode::OK, serde_json::json!({ "reset": total }))
}

/// POST /admin/sessions/{id}/reset
async fn reset_session(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.pools.sessions().reset(&id).await {
        Ok(()) => {
            info!(session_id = %id, "session reset via admin API");
            json_response(StatusCode::OK, serde_json::json!({ "reset": id }))
        }
        Err(identity_pool::Error::NotFound(_)) => {
            warn!(session_id = %id, "reset requested for unknown session");
            json_response(
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": format!("session not found: {id}") }),
            )
        }
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}
