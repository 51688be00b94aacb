//! Heartbeat verdicts.
//!
//! The polling loop itself lives in the manager; this module decides what
//! a single poll result means.

use std::time::Duration;

use pk_domain::config::HeartbeatConfig;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Presence matches the expected target.
    Healthy,
    /// Presence mismatch, still below the threshold.
    Missed { failures: u32 },
    /// Threshold reached: the session is considered lost.
    Lost { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    pub interval: Duration,
    pub max_failures: u32,
    pub stable_threshold: Duration,
}

impl HeartbeatMonitor {
    pub fn from_config(cfg: &HeartbeatConfig) -> Self {
        Self {
            interval: cfg.interval(),
            max_failures: cfg.max_failures.max(1),
            stable_threshold: cfg.stable_threshold(),
        }
    }

    /// Fold one poll result into the failure counter.
    pub fn observe(&self, failures: &mut u32, matched: bool) -> HeartbeatVerdict {
        if matched {
            *failures = 0;
            return HeartbeatVerdict::Healthy;
        }
        *failures = failures.saturating_add(1);
        if *failures >= self.max_failures {
            HeartbeatVerdict::Lost {
                failures: *failures,
            }
        } else {
            HeartbeatVerdict::Missed {
                failures: *failures,
            }
        }
    }

    pub fn is_stable(&self, stable_since: Option<Instant>, now: Instant) -> bool {
        stable_since
            .map(|since| now.saturating_duration_since(since) >= self.stable_threshold)
            .unwrap_or(false)
    }
}
