//! Per-group circuit breaker gating reconnect attempts.
//!
//! CLOSED lets every attempt through.  After `failure_threshold`
//! consecutive failures the breaker OPENs and refuses attempts until the
//! cooldown has elapsed since the last failure; the first check after that
//! moves it to HALF_OPEN and is the single trial attempt.  The trial's outcome
//! closes the breaker again or re-opens it immediately.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use pk_domain::config::CircuitConfig;
use pk_domain::GroupId;
use serde::Serialize;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitRecord {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    test_request_allowed: bool,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            last_failure: None,
            test_request_allowed: false,
        }
    }
}

impl CircuitRecord {
    fn cooldown_elapsed(&self, cooldown: Duration, now: Instant) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_duration_since(at) >= cooldown,
            None => true,
        }
    }
}

/// Breaker records for every group, behind one lock.
pub struct CircuitBreakers {
    threshold: u32,
    cooldown: Duration,
    records: Mutex<HashMap<GroupId, CircuitRecord>>,
}

impl CircuitBreakers {
    pub fn new(cfg: &CircuitConfig) -> Self {
        Self {
            threshold: cfg.failure_threshold.max(1),
            cooldown: cfg.cooldown(),
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a reconnect attempt may proceed now.  A `true` from an OPEN
    /// breaker whose cooldown has elapsed is the one HALF_OPEN trial attempt.
    pub fn can_attempt(&self, group: &GroupId, now: Instant) -> bool {
        let mut records = self.records.lock();
        let Some(rec) = records.get_mut(group) else {
            return true;
        };

        if rec.state == CircuitState::Open {
            if !rec.cooldown_elapsed(self.cooldown, now) {
                return false;
            }
            rec.state = CircuitState::HalfOpen;
            rec.test_request_allowed = true;
            tracing::info!(group_id = %group, "circuit half-open, allowing one trial attempt");
        }

        match rec.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => std::mem::take(&mut rec.test_request_allowed),
            CircuitState::Open => false,
        }
    }

    /// Count a failed attempt.  Returns the `(previous, current)` state.
    pub fn record_failure(&self, group: &GroupId, now: Instant) -> (CircuitState, CircuitState) {
        let mut records = self.records.lock();
        let rec = records.entry(group.clone()).or_default();
        let previous = rec.state;

        rec.failures = rec.failures.saturating_add(1);
        rec.last_failure = Some(now);

        match rec.state {
            CircuitState::HalfOpen => {
                rec.state = CircuitState::Open;
                rec.test_request_allowed = false;
                tracing::warn!(group_id = %group, "trial attempt failed, circuit re-opened");
            }
            CircuitState::Closed if rec.failures >= self.threshold => {
                rec.state = CircuitState::Open;
                tracing::warn!(
                    group_id = %group,
                    failures = rec.failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    "circuit opened"
                );
            }
            _ => {}
        }

        (previous, rec.state)
    }

    /// Reset the breaker to CLOSED.  Returns the state it was in.
    pub fn record_success(&self, group: &GroupId) -> CircuitState {
        let mut records = self.records.lock();
        match records.get_mut(group) {
            Some(rec) => {
                let previous = rec.state;
                *rec = CircuitRecord::default();
                previous
            }
            None => CircuitState::Closed,
        }
    }

    /// Time until an OPEN breaker may be tried again; zero otherwise.
    pub fn remaining_cooldown(&self, group: &GroupId, now: Instant) -> Duration {
        let records = self.records.lock();
        match records.get(group) {
            Some(rec) if rec.state == CircuitState::Open => match rec.last_failure {
                Some(at) => self
                    .cooldown
                    .saturating_sub(now.saturating_duration_since(at)),
                None => Duration::ZERO,
            },
            _ => Duration::ZERO,
        }
    }

    pub fn state(&self, group: &GroupId) -> CircuitState {
        self.records
            .lock()
            .get(group)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn failures(&self, group: &GroupId) -> u32 {
        self.records.lock().get(group).map(|r| r.failures).unwrap_or(0)
    }

    pub fn remove(&self, group: &GroupId) {
        self.records.lock().remove(group);
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
