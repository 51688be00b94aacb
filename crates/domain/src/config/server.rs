use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// HTTP status / keep-alive server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Env var holding the bearer token required by the session control
    /// routes.  Unset or empty leaves them open.
    #[serde(default = "d_admin_token_env")]
    pub admin_token_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: d_port(),
            host: d_host(),
            admin_token_env: d_admin_token_env(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}

fn d_port() -> u16 {
    11186
}

fn d_host() -> String {
    "127.0.0.1".into()
}

fn d_admin_token_env() -> String {
    "PK_ADMIN_TOKEN".into()
}
