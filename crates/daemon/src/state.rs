use std::sync::Arc;
use std::time::Instant;

use pk_domain::config::Config;
use pk_supervisor::SessionManager;
use sha2::{Digest, Sha256};

use crate::transport::StreamStatus;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub manager: Arc<SessionManager>,
    /// Whether the presence event stream is attached.
    pub stream: StreamStatus,
    pub started_at: Instant,
    /// SHA-256 of the control token; `None` leaves control routes open.
    pub admin_token_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, manager: Arc<SessionManager>, stream: StreamStatus) -> Self {
        Self {
            config,
            manager,
            stream,
            started_at: Instant::now(),
            admin_token_hash: None,
        }
    }

    /// Require `token` on the control routes.  Blank tokens are ignored.
    pub fn with_admin_token(mut self, token: Option<&str>) -> Self {
        self.admin_token_hash = token
            .filter(|t| !t.trim().is_empty())
            .map(|t| Sha256::digest(t.as_bytes()).to_vec());
        self
    }
}
