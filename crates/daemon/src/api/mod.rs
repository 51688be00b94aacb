//! Status and control API.
//!
//! A small keep-alive surface for hosting platforms (`/`, `/ping`,
//! `/health`) plus session inspection and control under `/v1/sessions`.
//! The mutating session routes sit behind [`guard::AdminGuard`].

pub mod guard;
pub mod health;
pub mod sessions;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(health::root))
        .route("/ping", get(health::ping))
        .route("/health", get(health::health))
        .route("/v1/sessions", get(sessions::list_sessions))
        .route(
            "/v1/sessions/:group",
            get(sessions::get_session)
                .put(sessions::join_session)
                .delete(sessions::stop_session),
        )
}

/// `{"error": msg}` with the given status.
pub(crate) fn api_error(status: StatusCode, msg: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": msg.into() }))).into_response()
}
