mod observability;
mod server;
mod service;
mod store;
mod supervisor;

pub use observability::*;
pub use server::*;
pub use service::*;
pub use store::*;
pub use supervisor::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Apply `PK_*` overrides on top of the file config.
    ///
    /// `lookup` is usually `|k| std::env::var(k).ok()`; tests pass a map.
    /// Returns the names of the variables that were applied.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();

        if let Some(identity) = lookup("PK_IDENTITY").filter(|v| !v.trim().is_empty()) {
            self.supervisor.identity = identity.trim().to_owned();
            applied.push("PK_IDENTITY");
        }
        if let Some(url) = lookup("PK_SERVICE_URL").filter(|v| !v.trim().is_empty()) {
            self.service.base_url = url.trim().to_owned();
            applied.push("PK_SERVICE_URL");
        }
        // Hosting platforms hand out the listen port through `PORT`.
        if let Some(port) = lookup("PK_PORT")
            .or_else(|| lookup("PORT"))
            .and_then(|v| v.trim().parse::<u16>().ok())
        {
            self.server.port = port;
            applied.push("PK_PORT");
        }

        applied
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Config {
    /// Validate the configuration, returning all issues found.
    ///
    /// Errors make the daemon refuse to start; warnings are logged.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let sup = &self.supervisor;

        if sup.identity.trim().is_empty() {
            errors.push(ConfigError::error(
                "supervisor.identity",
                "identity must be set (or PK_IDENTITY exported)",
            ));
        }

        // Backoff.
        if sup.backoff.base_delay_ms == 0 {
            errors.push(ConfigError::error(
                "supervisor.backoff.base_delay_ms",
                "base delay must be greater than 0",
            ));
        }
        if sup.backoff.multiplier < 1.0 {
            errors.push(ConfigError::error(
                "supervisor.backoff.multiplier",
                "multiplier must be at least 1.0",
            ));
        }
        if sup.backoff.max_delay_ms < sup.backoff.base_delay_ms {
            errors.push(ConfigError::error(
                "supervisor.backoff.max_delay_ms",
                "max delay must not be below the base delay",
            ));
        }
        if !(0.0..=1.0).contains(&sup.backoff.jitter) {
            errors.push(ConfigError::error(
                "supervisor.backoff.jitter",
                "jitter must be within 0.0..=1.0",
            ));
        }
        if sup.backoff.max_attempts == 0 {
            errors.push(ConfigError::error(
                "supervisor.backoff.max_attempts",
                "max attempts must be greater than 0",
            ));
        }

        // Circuit breaker.
        if sup.circuit.failure_threshold == 0 {
            errors.push(ConfigError::error(
                "supervisor.circuit.failure_threshold",
                "failure threshold must be greater than 0",
            ));
        }
        if sup.circuit.cooldown_ms == 0 {
            errors.push(ConfigError::error(
                "supervisor.circuit.cooldown_ms",
                "cooldown must be greater than 0",
            ));
        }

        // Heartbeat.
        if sup.heartbeat.interval_ms == 0 {
            errors.push(ConfigError::error(
                "supervisor.heartbeat.interval_ms",
                "heartbeat interval must be greater than 0",
            ));
        }
        if sup.heartbeat.max_failures == 0 {
            errors.push(ConfigError::error(
                "supervisor.heartbeat.max_failures",
                "max failures must be greater than 0",
            ));
        }

        if sup.validation.max_retries == 0 {
            errors.push(ConfigError::error(
                "supervisor.validation.max_retries",
                "at least one validation poll is required",
            ));
        }

        if !sup.close_sessions_on_shutdown {
            errors.push(ConfigError::warning(
                "supervisor.close_sessions_on_shutdown",
                "sessions stay open after shutdown until the service expires them",
            ));
        }

        // Store.
        if self.store.enabled && self.store.path.as_os_str().is_empty() {
            errors.push(ConfigError::error(
                "store.path",
                "path must not be empty when the store is enabled",
            ));
        }
        if !self.store.enabled {
            errors.push(ConfigError::warning(
                "store.enabled",
                "store disabled: sessions will not survive a restart",
            ));
        }

        // Server.
        if self.server.enabled {
            if self.server.port == 0 {
                errors.push(ConfigError::error(
                    "server.port",
                    "port must be greater than 0",
                ));
            }
            if self.server.host.trim().is_empty() {
                errors.push(ConfigError::error(
                    "server.host",
                    "host must not be empty",
                ));
            }
        }

        // Service.
        let base = self.service.base_url.trim();
        if base.is_empty() {
            errors.push(ConfigError::error(
                "service.base_url",
                "base_url must not be empty",
            ));
        } else if !(base.starts_with("http://") || base.starts_with("https://")) {
            errors.push(ConfigError::error(
                "service.base_url",
                "base_url must start with http:// or https://",
            ));
        }

        if !(0.0..=1.0).contains(&self.observability.sample_rate) {
            errors.push(ConfigError::error(
                "observability.sample_rate",
                "sample rate must be within 0.0..=1.0",
            ));
        }

        errors
    }
}
