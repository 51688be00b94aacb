//! Runtime construction and background-task spawning extracted from `main.rs`.

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use pk_domain::config::{Config, ConfigSeverity};
use pk_store::JsonSettingsStore;
use pk_supervisor::{BackoffPolicy, SessionManager, SettingsStore};

use crate::state::AppState;
use crate::transport::HttpPresenceTransport;

/// Everything `serve` needs, wired but not yet running.
pub struct Runtime {
    pub state: AppState,
    pub manager: Arc<SessionManager>,
    pub transport: Arc<HttpPresenceTransport>,
    /// Parent of every background task's token.
    pub shutdown: CancellationToken,
}

/// Validate config and build the transport, store and session manager.
pub fn build_runtime(config: Arc<Config>) -> anyhow::Result<Runtime> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }

    // ── Presence service client ──────────────────────────────────────
    let token = std::env::var(&config.service.token_env)
        .ok()
        .filter(|t| !t.trim().is_empty());
    if token.is_none() {
        tracing::warn!(
            env = %config.service.token_env,
            "no service token set, calling the presence service unauthenticated"
        );
    }
    let transport = Arc::new(
        HttpPresenceTransport::new(&config.service, token)
            .context("building presence service client")?,
    );
    tracing::info!(url = %config.service.base_url, "presence service client ready");

    // ── Settings store ───────────────────────────────────────────────
    let store: Option<Arc<dyn SettingsStore>> = if config.store.enabled {
        let store = JsonSettingsStore::open(&config.store.path)
            .with_context(|| format!("opening settings store {}", config.store.path.display()))?;
        Some(Arc::new(store))
    } else {
        tracing::warn!("settings store disabled, sessions will not survive a restart");
        None
    };

    // ── Session manager ──────────────────────────────────────────────
    let manager = SessionManager::new(config.supervisor.clone(), transport.clone(), store);

    // ── Control token (read once, hashed for constant-time checks) ──
    let admin_env = &config.server.admin_token_env;
    let admin_token = std::env::var(admin_env)
        .ok()
        .filter(|t| !t.trim().is_empty());
    if admin_token.is_some() {
        tracing::info!(env = %admin_env, "session control routes require a bearer token");
    } else {
        tracing::warn!(
            env = %admin_env,
            host = %config.server.host,
            "no control token set, session control routes are open"
        );
    }

    let state = AppState::new(config.clone(), manager.clone(), transport.stream_status())
        .with_admin_token(admin_token.as_deref());

    Ok(Runtime {
        state,
        manager,
        transport,
        shutdown: CancellationToken::new(),
    })
}

/// Attach the event stream and route its updates into the manager.
pub fn spawn_background_tasks(rt: &Runtime) -> Vec<JoinHandle<()>> {
    let config = &rt.state.config;
    let url = config.service.resolved_events_url();
    let backoff = BackoffPolicy::from_config(&config.supervisor.backoff);

    // Subscribe before the stream starts so no early update is missed.
    rt.manager.start_presence_listener();
    let events = rt
        .transport
        .event_stream(url, backoff)
        .spawn(rt.shutdown.child_token());

    vec![events]
}
