use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presence service (transport)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where the external presence service lives and how to authenticate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// REST base URL, e.g. `http://localhost:8700`.
    #[serde(default = "d_base_url")]
    pub base_url: String,

    /// WebSocket URL of the presence-update stream.  When `None` it is
    /// derived from `base_url` (`ws(s)://…/v1/events`).
    #[serde(default)]
    pub events_url: Option<String>,

    /// Environment variable holding the bearer token.
    #[serde(default = "d_token_env")]
    pub token_env: String,

    #[serde(default = "d_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            events_url: None,
            token_env: d_token_env(),
            request_timeout_ms: d_request_timeout_ms(),
        }
    }
}

impl ServiceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The events stream URL, explicit or derived from `base_url`.
    pub fn resolved_events_url(&self) -> String {
        if let Some(url) = &self.events_url {
            return url.clone();
        }
        let base = self.base_url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_owned()
        };
        format!("{ws_base}/v1/events")
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "http://127.0.0.1:8700".into()
}

fn d_token_env() -> String {
    "PK_SERVICE_TOKEN".into()
}

fn d_request_timeout_ms() -> u64 {
    10_000
}
