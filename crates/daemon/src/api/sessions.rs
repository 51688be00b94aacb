//! Session inspection and control.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;

use pk_domain::{GroupId, SessionFlags, TargetId};
use pk_supervisor::{JoinFailure, SupervisorError};

use super::api_error;
use super::guard::AdminGuard;
use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Every group the manager knows about, live or reconnecting.
pub async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.manager.status_all();
    Json(serde_json::json!({
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /v1/sessions/:group
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn get_session(State(state): State<AppState>, Path(group): Path<String>) -> Response {
    match state.manager.status(&GroupId::from(group)) {
        Some(status) => Json(status).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "no session for group"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PUT /v1/sessions/:group
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct JoinBody {
    pub target_id: String,
    /// Defaults to `true` when omitted.
    #[serde(default)]
    pub self_mute: Option<bool>,
    /// Defaults to `true` when omitted.
    #[serde(default)]
    pub self_deaf: Option<bool>,
}

/// Join (or switch to) a target and persist it for restarts.
pub async fn join_session(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(group): Path<String>,
    Json(body): Json<JoinBody>,
) -> Response {
    let defaults = SessionFlags::default();
    let flags = SessionFlags {
        self_mute: body.self_mute.unwrap_or(defaults.self_mute),
        self_deaf: body.self_deaf.unwrap_or(defaults.self_deaf),
    };
    let group = GroupId::from(group);
    let target = TargetId::from(body.target_id);

    match state.manager.join_by_id(&group, &target, flags).await {
        Ok(outcome) => {
            let code = match outcome.failure() {
                None => StatusCode::OK,
                Some(JoinFailure::ShuttingDown) => StatusCode::SERVICE_UNAVAILABLE,
                Some(JoinFailure::Superseded) => StatusCode::CONFLICT,
                Some(JoinFailure::TransportJoin(_) | JoinFailure::ValidationTimeout) => {
                    StatusCode::BAD_GATEWAY
                }
            };
            (code, Json(outcome)).into_response()
        }
        Err(e @ SupervisorError::InvalidTarget(_)) => {
            api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// DELETE /v1/sessions/:group
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Default, Deserialize)]
pub struct StopQuery {
    /// Keep the persisted record so the group is restored on restart.
    #[serde(default)]
    pub keep_settings: bool,
}

pub async fn stop_session(
    _guard: AdminGuard,
    State(state): State<AppState>,
    Path(group): Path<String>,
    Query(query): Query<StopQuery>,
) -> impl IntoResponse {
    let group = GroupId::from(group);
    let stopped = state.manager.disconnect(&group, !query.keep_settings).await;
    Json(serde_json::json!({
        "group_id": group,
        "stopped": stopped,
        "settings_removed": !query.keep_settings,
    }))
}
