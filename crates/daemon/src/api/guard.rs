//! `AdminGuard`: bearer-token check for the session control routes.
//!
//! Handlers opt in with a `_guard: AdminGuard` parameter.  Without a
//! configured token every request passes.

use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::Response;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use super::api_error;
use crate::state::AppState;

pub struct AdminGuard;

#[async_trait]
impl FromRequestParts<AppState> for AdminGuard {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = &state.admin_token_hash else {
            return Ok(AdminGuard);
        };

        let provided = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .unwrap_or("");

        // Fixed-length digests, compared in constant time.
        let provided = Sha256::digest(provided.as_bytes());
        if !bool::from(provided.ct_eq(expected.as_slice())) {
            tracing::warn!(path = %parts.uri.path(), "rejected control request: bad token");
            return Err(api_error(StatusCode::UNAUTHORIZED, "invalid admin token"));
        }
        Ok(AdminGuard)
    }
}
