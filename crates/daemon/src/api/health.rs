//! Keep-alive and health endpoints (public, no auth).

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};

use crate::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET / and GET /ping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.manager.is_shutting_down() {
        "stopping"
    } else {
        "running"
    };
    Json(serde_json::json!({
        "name": "presence-keeper",
        "version": env!("CARGO_PKG_VERSION"),
        "status": status,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn ping() -> &'static str {
    "pong"
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// 200 while the event stream is attached and the manager is running,
/// 503 otherwise.  Session counts are informational only.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let sessions = state.manager.status_all();
    let connected = sessions.iter().filter(|s| s.is_connected()).count();
    let stream = state.stream.is_connected();
    let shutting_down = state.manager.is_shutting_down();
    let healthy = stream && !shutting_down;

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "degraded" },
            "event_stream": stream,
            "shutting_down": shutting_down,
            "sessions": {
                "total": sessions.len(),
                "connected": connected,
            },
        })),
    )
}
