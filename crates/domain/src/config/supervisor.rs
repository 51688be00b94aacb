use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tuning for the session supervisor: reconnection, circuit breaking,
/// heartbeats and post-join validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Identity whose presence is checked against the authoritative state
    /// (the account this process connects as).
    #[serde(default)]
    pub identity: String,

    /// Close transport sessions on shutdown.  `false` keeps them open so a
    /// quick restart finds the presence still in place.
    #[serde(default = "d_true")]
    pub close_sessions_on_shutdown: bool,

    /// Pause after tearing down a previous target before joining a new one.
    #[serde(default = "d_retarget_settle_ms")]
    pub retarget_settle_ms: u64,

    /// Upper bound for each transport close during shutdown.
    #[serde(default = "d_close_timeout_ms")]
    pub close_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            close_sessions_on_shutdown: true,
            retarget_settle_ms: d_retarget_settle_ms(),
            close_timeout_ms: d_close_timeout_ms(),
            backoff: BackoffConfig::default(),
            circuit: CircuitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn retarget_settle(&self) -> Duration {
        Duration::from_millis(self.retarget_settle_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Exponential backoff between reconnect attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "d_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "d_multiplier")]
    pub multiplier: f64,
    #[serde(default = "d_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Upper bound of the random spread: the jitter factor is drawn from
    /// `[1.0, 1.0 + jitter)`.
    #[serde(default = "d_jitter")]
    pub jitter: f64,
    /// Reconnect attempts per failure streak before the group is dropped.
    #[serde(default = "d_max_attempts")]
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: d_base_delay_ms(),
            multiplier: d_multiplier(),
            max_delay_ms: d_max_delay_ms(),
            jitter: d_jitter(),
            max_attempts: d_max_attempts(),
        }
    }
}

/// Per-group circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the breaker.
    #[serde(default = "d_failure_threshold")]
    pub failure_threshold: u32,
    /// Time an open breaker waits before allowing a single trial attempt.
    #[serde(default = "d_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Added to the remaining cooldown when scheduling the re-check.
    #[serde(default = "d_recheck_margin_ms")]
    pub recheck_margin_ms: u64,
    /// The re-check is never scheduled sooner than this.
    #[serde(default = "d_recheck_floor_ms")]
    pub recheck_floor_ms: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: d_failure_threshold(),
            cooldown_ms: d_cooldown_ms(),
            recheck_margin_ms: d_recheck_margin_ms(),
            recheck_floor_ms: d_recheck_floor_ms(),
        }
    }
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn recheck_margin(&self) -> Duration {
        Duration::from_millis(self.recheck_margin_ms)
    }

    pub fn recheck_floor(&self) -> Duration {
        Duration::from_millis(self.recheck_floor_ms)
    }
}

/// Periodic authoritative-state polling while connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "d_heartbeat_interval_ms")]
    pub interval_ms: u64,
    /// Consecutive mismatching polls that count as a lost session.
    #[serde(default = "d_max_failures")]
    pub max_failures: u32,
    /// Continuous connected time after which prior instability is forgiven.
    #[serde(default = "d_stable_threshold_ms")]
    pub stable_threshold_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: d_heartbeat_interval_ms(),
            max_failures: d_max_failures(),
            stable_threshold_ms: d_stable_threshold_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stable_threshold(&self) -> Duration {
        Duration::from_millis(self.stable_threshold_ms)
    }
}

/// Post-join validation: grace period, then bounded polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "d_propagation_grace_ms")]
    pub propagation_grace_ms: u64,
    #[serde(default = "d_max_retries")]
    pub max_retries: u32,
    #[serde(default = "d_retry_spacing_ms")]
    pub retry_spacing_ms: u64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            propagation_grace_ms: d_propagation_grace_ms(),
            max_retries: d_max_retries(),
            retry_spacing_ms: d_retry_spacing_ms(),
        }
    }
}

impl ValidationConfig {
    pub fn propagation_grace(&self) -> Duration {
        Duration::from_millis(self.propagation_grace_ms)
    }

    pub fn retry_spacing(&self) -> Duration {
        Duration::from_millis(self.retry_spacing_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_true() -> bool {
    true
}
fn d_retarget_settle_ms() -> u64 {
    500
}
fn d_close_timeout_ms() -> u64 {
    5_000
}
fn d_base_delay_ms() -> u64 {
    5_000
}
fn d_multiplier() -> f64 {
    1.5
}
fn d_max_delay_ms() -> u64 {
    300_000
}
fn d_jitter() -> f64 {
    0.3
}
fn d_max_attempts() -> u32 {
    10
}
fn d_failure_threshold() -> u32 {
    5
}
fn d_cooldown_ms() -> u64 {
    120_000
}
fn d_recheck_margin_ms() -> u64 {
    1_000
}
fn d_recheck_floor_ms() -> u64 {
    5_000
}
fn d_heartbeat_interval_ms() -> u64 {
    30_000
}
fn d_max_failures() -> u32 {
    3
}
fn d_stable_threshold_ms() -> u64 {
    120_000
}
fn d_propagation_grace_ms() -> u64 {
    2_000
}
fn d_max_retries() -> u32 {
    4
}
fn d_retry_spacing_ms() -> u64 {
    3_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.backoff.base_delay_ms, 5_000);
        assert!((cfg.backoff.multiplier - 1.5).abs() < f64::EPSILON);
        assert_eq!(cfg.backoff.max_delay_ms, 300_000);
        assert_eq!(cfg.backoff.max_attempts, 10);
        assert_eq!(cfg.circuit.failure_threshold, 5);
        assert_eq!(cfg.circuit.cooldown(), Duration::from_secs(120));
        assert_eq!(cfg.heartbeat.interval(), Duration::from_secs(30));
        assert_eq!(cfg.heartbeat.max_failures, 3);
        assert_eq!(cfg.heartbeat.stable_threshold(), Duration::from_secs(120));
        assert_eq!(cfg.validation.max_retries, 4);
        assert!(cfg.close_sessions_on_shutdown);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let toml_str = r#"
            identity = "42"
            [heartbeat]
            interval_ms = 10000
        "#;
        let cfg: SupervisorConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.identity, "42");
        assert_eq!(cfg.heartbeat.interval_ms, 10_000);
        assert_eq!(cfg.heartbeat.max_failures, 3);
        assert_eq!(cfg.circuit.cooldown_ms, 120_000);
    }
}
