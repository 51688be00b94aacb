use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Settings store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence of desired sessions across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Disable to run without persistence (sessions are not restored).
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default = "d_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: d_store_path(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}

fn d_store_path() -> PathBuf {
    PathBuf::from("./data/presence_settings.json")
}
