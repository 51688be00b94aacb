//! The session manager: one resilient presence session per group.
//!
//! Owns every per-group registry and drives the join → validate →
//! heartbeat → disconnect → reconnect loop.  Registries are separate
//! `parking_lot` locks and none is held across an `.await`; the guards
//! described on each flow keep per-group ordering sane across the
//! suspension points.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use pk_domain::config::SupervisorConfig;
use pk_domain::{GroupId, PresenceEvent, SessionFlags, Target, TargetId};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::circuit::{CircuitBreakers, CircuitState};
use crate::correlation::CorrelationTracker;
use crate::error::{JoinFailure, SupervisorError};
use crate::events::{DisconnectReason, EventBus, SessionEvent};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
use crate::state::{ConnectionState, StateMachine};
use crate::status::{JoinOutcome, SessionStatus};
use crate::store::SettingsStore;
use crate::timers::{TimerKind, TimerRegistry};
use crate::transport::{PresenceTransport, SessionHandle};

const EVENT_CAPACITY: usize = 256;

/// A committed, validated session.
struct Session {
    target: Target,
    flags: SessionFlags,
    /// `None` when the open timed out but presence confirmed the join.
    handle: Option<SessionHandle>,
    joined_at: DateTime<Utc>,
    connected_at: Instant,
    heartbeat_failures: u32,
    stable_since: Option<Instant>,
}

/// What a group is currently trying to hold, live session or not.
#[derive(Clone)]
struct Intent {
    target: Target,
    flags: SessionFlags,
}

enum HeartbeatStep {
    Continue,
    Stop,
    Lost,
}

enum Commit {
    Fresh { replaced: Option<Session> },
    Duplicate { existing: Option<SessionHandle> },
    Abandoned,
}

/// Outcome of restoring persisted sessions at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitializeReport {
    pub restored: Vec<GroupId>,
    pub failed: Vec<GroupId>,
    /// Records deleted because their target no longer exists.
    pub removed: Vec<GroupId>,
    /// Records kept but not attempted (target lookup failed).
    pub skipped: Vec<GroupId>,
}

enum Restore {
    Restored,
    Failed,
    Removed,
    Skipped,
}

pub struct SessionManager {
    config: SupervisorConfig,
    transport: Arc<dyn PresenceTransport>,
    store: Option<Arc<dyn SettingsStore>>,
    backoff: BackoffPolicy,
    heartbeat: HeartbeatMonitor,

    sessions: Mutex<HashMap<GroupId, Session>>,
    intents: Mutex<HashMap<GroupId, Intent>>,
    attempts: Mutex<HashMap<GroupId, u32>>,
    states: StateMachine,
    breakers: CircuitBreakers,
    correlation: CorrelationTracker,
    timers: TimerRegistry,

    /// Root token: cancelled once by `shutdown`, parent of every group scope.
    shutdown: CancellationToken,
    events: EventBus,
    listener: Mutex<Option<AbortHandle>>,
    me: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        config: SupervisorConfig,
        transport: Arc<dyn PresenceTransport>,
        store: Option<Arc<dyn SettingsStore>>,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let events = EventBus::new(EVENT_CAPACITY);
        let backoff = BackoffPolicy::from_config(&config.backoff);
        let heartbeat = HeartbeatMonitor::from_config(&config.heartbeat);
        let breakers = CircuitBreakers::new(&config.circuit);

        Arc::new_cyclic(|me| Self {
            transport,
            store,
            backoff,
            heartbeat,
            sessions: Mutex::new(HashMap::new()),
            intents: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            states: StateMachine::new(events.clone()),
            breakers,
            correlation: CorrelationTracker::new(),
            timers: TimerRegistry::new(shutdown.clone()),
            shutdown,
            events,
            listener: Mutex::new(None),
            me: me.clone(),
            config,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Join
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Open, validate and commit a session for `group` on `target`.
    ///
    /// Only malformed input is an error; every other outcome is reported
    /// in the returned [`JoinOutcome`].
    pub async fn join(
        &self,
        group: &GroupId,
        target: Target,
        flags: SessionFlags,
        persist: bool,
    ) -> Result<JoinOutcome, SupervisorError> {
        validate_target(group, &target)?;

        if self.is_shutting_down() {
            return Ok(JoinOutcome::Failed {
                failure: JoinFailure::ShuttingDown,
            });
        }

        let live = self.sessions.lock().get(group).map(|s| s.target.id.clone());
        match live {
            Some(current) if current == target.id => {
                tracing::warn!(group_id = %group, target_id = %target.id, "already joined");
                if let Some(status) = self.status(group) {
                    return Ok(JoinOutcome::AlreadyJoined { status });
                }
            }
            Some(current) => {
                tracing::info!(
                    group_id = %group,
                    from = %current,
                    to = %target.id,
                    "switching target"
                );
                self.disconnect(group, false).await;
                tokio::time::sleep(self.config.retarget_settle()).await;
                if self.is_shutting_down() {
                    return Ok(JoinOutcome::Failed {
                        failure: JoinFailure::ShuttingDown,
                    });
                }
            }
            None => {}
        }

        // An explicit join supersedes any pending reconnect lineage.
        self.timers.cancel(group, TimerKind::Reconnect);
        let scope = self.timers.renew_scope(group);

        let outcome = self.connect(group, target, flags, persist, scope).await;
        if let JoinOutcome::Failed { failure } = &outcome {
            if !failure.is_terminal() && !self.sessions.lock().contains_key(group) {
                self.intents.lock().remove(group);
                self.correlation.clear(group);
            }
        }
        Ok(outcome)
    }

    /// Resolve `target_id` and join it, persisting on success.
    pub async fn join_by_id(
        &self,
        group: &GroupId,
        target_id: &TargetId,
        flags: SessionFlags,
    ) -> Result<JoinOutcome, SupervisorError> {
        if target_id.is_empty() {
            return Err(SupervisorError::InvalidTarget("target id is empty".into()));
        }
        let target = match self.transport.resolve_target(target_id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                return Err(SupervisorError::InvalidTarget(format!(
                    "target {target_id} not found"
                )))
            }
            Err(e) => {
                return Ok(JoinOutcome::Failed {
                    failure: JoinFailure::TransportJoin(e.to_string()),
                })
            }
        };
        self.join(group, target, flags, true).await
    }

    /// Shared by explicit joins and reconnects.
    async fn connect(
        &self,
        group: &GroupId,
        target: Target,
        flags: SessionFlags,
        persist: bool,
        scope: CancellationToken,
    ) -> JoinOutcome {
        self.intents.lock().insert(
            group.clone(),
            Intent {
                target: target.clone(),
                flags,
            },
        );
        let cid = self.correlation.reset(group);
        self.states
            .set(group, ConnectionState::Connecting, Some(cid.as_str()));
        tracing::info!(
            group_id = %group,
            correlation_id = %cid,
            target_id = %target.id,
            target = %target.name,
            "joining target"
        );

        let (handle, recovered) = match self.transport.open_session(&target, flags).await {
            Ok(handle) => (Some(handle), false),
            Err(e) if e.is_timeout() => {
                tracing::warn!(
                    group_id = %group,
                    correlation_id = %cid,
                    error = %e,
                    "open timed out, checking presence"
                );
                (None, true)
            }
            Err(e) => {
                tracing::error!(
                    group_id = %group,
                    correlation_id = %cid,
                    error = %e,
                    "failed to open session"
                );
                if scope.is_cancelled() {
                    return self.abandoned();
                }
                return self.fail_join(
                    group,
                    &target,
                    &cid,
                    JoinFailure::TransportJoin(e.to_string()),
                );
            }
        };

        let grace = self.config.validation.propagation_grace();
        if !sleep_unless_cancelled(&scope, grace).await {
            self.close_quietly(handle.as_ref()).await;
            return self.abandoned();
        }

        if !self.validate_presence(group, &target.id, &scope).await {
            self.close_quietly(handle.as_ref()).await;
            if scope.is_cancelled() {
                return self.abandoned();
            }
            tracing::warn!(
                group_id = %group,
                correlation_id = %cid,
                "presence not confirmed in time"
            );
            let failure = if recovered {
                JoinFailure::TransportJoin("open timed out and presence was not confirmed".into())
            } else {
                JoinFailure::ValidationTimeout
            };
            return self.fail_join(group, &target, &cid, failure);
        }

        let now = Instant::now();
        let commit = {
            let mut sessions = self.sessions.lock();
            let duplicate = sessions
                .get(group)
                .filter(|existing| existing.target.id == target.id)
                .map(|existing| existing.handle.clone());
            if scope.is_cancelled() {
                Commit::Abandoned
            } else {
                match duplicate {
                    Some(existing) => Commit::Duplicate { existing },
                    None => {
                        let replaced = sessions.insert(
                            group.clone(),
                            Session {
                                target: target.clone(),
                                flags,
                                handle: handle.clone(),
                                joined_at: Utc::now(),
                                connected_at: now,
                                heartbeat_failures: 0,
                                stable_since: Some(now),
                            },
                        );
                        // Under the sessions lock so CONNECTED never outlives
                        // a concurrent teardown.
                        self.states
                            .set(group, ConnectionState::Connected, Some(cid.as_str()));
                        Commit::Fresh { replaced }
                    }
                }
            }
        };

        match commit {
            Commit::Abandoned => {
                self.close_quietly(handle.as_ref()).await;
                self.abandoned()
            }
            Commit::Duplicate { existing } => {
                if handle.is_some() && handle != existing {
                    self.close_quietly(handle.as_ref()).await;
                }
                tracing::warn!(group_id = %group, "concurrent join already committed this target");
                match self.status(group) {
                    Some(status) => JoinOutcome::AlreadyJoined { status },
                    None => self.abandoned(),
                }
            }
            Commit::Fresh { replaced } => {
                self.start_heartbeat(group, scope);

                if let Some(old) = replaced {
                    tracing::info!(
                        group_id = %group,
                        replaced = %old.target.id,
                        "replaced concurrently committed session"
                    );
                    self.close_quietly(old.handle.as_ref()).await;
                }

                if persist {
                    self.save_persisted(group, &target, flags).await;
                }

                tracing::info!(
                    group_id = %group,
                    correlation_id = %cid,
                    target = %target.name,
                    "joined target"
                );
                self.events.publish(SessionEvent::Joined {
                    group_id: group.clone(),
                    target_id: target.id.clone(),
                    correlation_id: cid,
                    recovered_from_timeout: recovered,
                });

                match self.status(group) {
                    Some(status) => JoinOutcome::Joined { status },
                    // Torn down between commit and here.
                    None => self.abandoned(),
                }
            }
        }
    }

    /// Poll the authoritative presence until it reports `expected`.
    async fn validate_presence(
        &self,
        group: &GroupId,
        expected: &TargetId,
        scope: &CancellationToken,
    ) -> bool {
        let retries = self.config.validation.max_retries.max(1);
        let spacing = self.config.validation.retry_spacing();

        for attempt in 1..=retries {
            if attempt > 1 && !sleep_unless_cancelled(scope, spacing).await {
                return false;
            }
            match self
                .transport
                .query_presence(group, &self.config.identity)
                .await
            {
                Ok(Some(actual)) if &actual == expected => return true,
                Ok(actual) => tracing::debug!(
                    group_id = %group,
                    attempt,
                    actual = ?actual.as_ref().map(TargetId::as_str),
                    "presence not confirmed yet"
                ),
                Err(e) => tracing::debug!(
                    group_id = %group,
                    attempt,
                    error = %e,
                    "presence check failed"
                ),
            }
        }
        false
    }

    fn fail_join(
        &self,
        group: &GroupId,
        target: &Target,
        cid: &str,
        failure: JoinFailure,
    ) -> JoinOutcome {
        self.states.set(group, ConnectionState::Idle, Some(cid));
        self.events.publish(SessionEvent::JoinFailed {
            group_id: group.clone(),
            target_id: target.id.clone(),
            reason: failure.to_string(),
        });
        JoinOutcome::Failed { failure }
    }

    fn abandoned(&self) -> JoinOutcome {
        let failure = if self.is_shutting_down() {
            JoinFailure::ShuttingDown
        } else {
            JoinFailure::Superseded
        };
        JoinOutcome::Failed { failure }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Heartbeat
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    fn start_heartbeat(&self, group: &GroupId, scope: CancellationToken) {
        let me = self.me.clone();
        let interval = self.heartbeat.interval;

        self.timers
            .schedule(group, TimerKind::Heartbeat, move |id| async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(mgr) = me.upgrade() else { return };
                    if mgr.is_shutting_down() {
                        break;
                    }
                    match mgr.heartbeat_tick(&id.group).await {
                        HeartbeatStep::Continue => {}
                        HeartbeatStep::Stop => break,
                        HeartbeatStep::Lost => {
                            // Release first: handle_disconnect cancels the
                            // heartbeat slot and must not abort this task.
                            mgr.timers.release(&id);
                            mgr.handle_disconnect(&id.group, DisconnectReason::HeartbeatFailure)
                                .await;
                            return;
                        }
                    }
                }

                if let Some(mgr) = me.upgrade() {
                    mgr.timers.release(&id);
                }
            });
    }

    async fn heartbeat_tick(&self, group: &GroupId) -> HeartbeatStep {
        let expected = match self.sessions.lock().get(group) {
            Some(session) => session.target.id.clone(),
            None => return HeartbeatStep::Stop,
        };

        let presence = self
            .transport
            .query_presence(group, &self.config.identity)
            .await;
        let matched = match presence {
            Ok(actual) => actual.as_ref() == Some(&expected),
            Err(e) => {
                tracing::debug!(group_id = %group, error = %e, "heartbeat check inconclusive");
                return HeartbeatStep::Continue;
            }
        };

        let now = Instant::now();
        let (verdict, stable) = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(group) else {
                return HeartbeatStep::Stop;
            };
            if session.target.id != expected {
                return HeartbeatStep::Continue;
            }
            let verdict = self.heartbeat.observe(&mut session.heartbeat_failures, matched);
            if verdict == HeartbeatVerdict::Healthy {
                session.stable_since.get_or_insert(now);
            } else {
                session.stable_since = None;
            }
            (verdict, self.heartbeat.is_stable(session.stable_since, now))
        };

        let cid = self.correlation.current(group).unwrap_or_default();
        match verdict {
            HeartbeatVerdict::Healthy => {
                if stable {
                    self.forgive_instability(group, &cid);
                }
                HeartbeatStep::Continue
            }
            HeartbeatVerdict::Missed { failures } => {
                tracing::debug!(
                    group_id = %group,
                    correlation_id = %cid,
                    failures,
                    max_failures = self.heartbeat.max_failures,
                    "heartbeat miss"
                );
                self.events.publish(SessionEvent::HeartbeatMissed {
                    group_id: group.clone(),
                    failures,
                    max_failures: self.heartbeat.max_failures,
                });
                HeartbeatStep::Continue
            }
            HeartbeatVerdict::Lost { failures } => {
                tracing::warn!(
                    group_id = %group,
                    correlation_id = %cid,
                    failures,
                    "heartbeat failed, presence lost"
                );
                self.events.publish(SessionEvent::HeartbeatMissed {
                    group_id: group.clone(),
                    failures,
                    max_failures: self.heartbeat.max_failures,
                });
                HeartbeatStep::Lost
            }
        }
    }

    /// A long-lived connection wipes the slate: attempts and breaker reset.
    fn forgive_instability(&self, group: &GroupId, cid: &str) {
        let attempts = self.attempts.lock().remove(group).unwrap_or(0);
        let previous = self.breakers.record_success(group);
        if attempts == 0 && previous == CircuitState::Closed {
            return;
        }
        tracing::info!(
            group_id = %group,
            correlation_id = %cid,
            forgiven_attempts = attempts,
            "connection stable, resetting reconnect attempts"
        );
        if previous != CircuitState::Closed {
            self.events.publish(SessionEvent::CircuitChanged {
                group_id: group.clone(),
                from: previous,
                to: CircuitState::Closed,
            });
        }
        self.events.publish(SessionEvent::Stabilized {
            group_id: group.clone(),
            forgiven_attempts: attempts,
        });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Disconnect & reconnect
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Tear down a session that was lost (not stopped) and decide whether
    /// to reconnect.  Concurrent triggers for the same loss collapse into
    /// one because only the caller that removes the session proceeds.
    pub async fn handle_disconnect(&self, group: &GroupId, reason: DisconnectReason) {
        if self.is_shutting_down() {
            return;
        }
        let Some(session) = self.sessions.lock().remove(group) else {
            tracing::debug!(group_id = %group, reason = %reason, "no live session, ignoring disconnect");
            return;
        };

        let scope = self.timers.scope(group);
        let cid = self.correlation.get_or_create(group);
        tracing::warn!(
            group_id = %group,
            correlation_id = %cid,
            target_id = %session.target.id,
            reason = %reason,
            "session lost"
        );

        self.states
            .set(group, ConnectionState::Disconnecting, Some(cid.as_str()));
        self.timers.cancel(group, TimerKind::Heartbeat);
        self.events.publish(SessionEvent::Disconnected {
            group_id: group.clone(),
            target_id: session.target.id.clone(),
            reason,
        });

        self.close_quietly(session.handle.as_ref()).await;
        if scope.is_cancelled() {
            return;
        }

        let target = match self.transport.resolve_target(&session.target.id).await {
            Ok(Some(target)) => target,
            Ok(None) => {
                if scope.is_cancelled() {
                    return;
                }
                self.target_gone(group, &session.target.id, &cid).await;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    group_id = %group,
                    correlation_id = %cid,
                    error = %e,
                    "could not resolve target, assuming it still exists"
                );
                session.target
            }
        };

        self.schedule_reconnect(group, target, session.flags, scope);
    }

    /// Gate on the breaker and attempt budget, then arm the reconnect timer.
    fn schedule_reconnect(
        &self,
        group: &GroupId,
        target: Target,
        flags: SessionFlags,
        scope: CancellationToken,
    ) {
        if self.is_shutting_down() || scope.is_cancelled() {
            return;
        }
        if self.sessions.lock().contains_key(group) {
            tracing::debug!(group_id = %group, "session live again, reconnect not needed");
            return;
        }

        let cid = self.correlation.get_or_create(group);
        let now = Instant::now();

        if !self.breakers.can_attempt(group, now) {
            let remaining = self.breakers.remaining_cooldown(group, now);
            let delay =
                (remaining + self.config.circuit.recheck_margin()).max(self.config.circuit.recheck_floor());
            tracing::info!(
                group_id = %group,
                correlation_id = %cid,
                circuit = ?self.breakers.state(group),
                delay_ms = delay.as_millis() as u64,
                "circuit refuses reconnect, re-checking later"
            );
            self.states
                .set(group, ConnectionState::Reconnecting, Some(cid.as_str()));
            self.events.publish(SessionEvent::CircuitRecheckScheduled {
                group_id: group.clone(),
                delay_ms: delay.as_millis() as u64,
            });

            let me = self.me.clone();
            self.timers
                .schedule(group, TimerKind::Reconnect, move |id| async move {
                    if !sleep_unless_cancelled(&scope, delay).await {
                        return;
                    }
                    let Some(mgr) = me.upgrade() else { return };
                    mgr.timers.release(&id);
                    mgr.schedule_reconnect(&id.group, target, flags, scope);
                });
            return;
        }

        let attempt = self.reconnect_attempts(group);
        if self.backoff.should_give_up(attempt) {
            self.give_up(group, attempt, &cid);
            return;
        }

        self.attempts.lock().insert(group.clone(), attempt + 1);
        let delay = self.backoff.delay_for_attempt(attempt);
        self.states
            .set(group, ConnectionState::Reconnecting, Some(cid.as_str()));
        tracing::info!(
            group_id = %group,
            correlation_id = %cid,
            attempt = attempt + 1,
            max_attempts = self.backoff.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.events.publish(SessionEvent::ReconnectScheduled {
            group_id: group.clone(),
            attempt: attempt + 1,
            delay_ms: delay.as_millis() as u64,
        });

        let me = self.me.clone();
        self.timers
            .schedule(group, TimerKind::Reconnect, move |id| async move {
                if !sleep_unless_cancelled(&scope, delay).await {
                    return;
                }
                let Some(mgr) = me.upgrade() else { return };
                // Release first: the join below cancels the reconnect slot.
                mgr.timers.release(&id);
                mgr.handle_reconnect(&id.group, target, flags, scope).await;
            });
    }

    async fn handle_reconnect(
        &self,
        group: &GroupId,
        target: Target,
        flags: SessionFlags,
        scope: CancellationToken,
    ) {
        if self.is_shutting_down() || scope.is_cancelled() {
            return;
        }
        let live = self.sessions.lock().get(group).map(|s| s.target.id.clone());
        if let Some(current) = live {
            if current == target.id {
                tracing::debug!(group_id = %group, "already connected, skipping reconnect");
            } else {
                tracing::info!(group_id = %group, current = %current, "newer session live, dropping reconnect");
            }
            return;
        }

        let cid = self.correlation.get_or_create(group);
        let attempt = self.reconnect_attempts(group);
        tracing::info!(
            group_id = %group,
            correlation_id = %cid,
            attempt,
            target = %target.name,
            "attempting reconnect"
        );

        let resolved = match self.transport.resolve_target(&target.id).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                if !scope.is_cancelled() {
                    self.target_gone(group, &target.id, &cid).await;
                }
                return;
            }
            Err(e) => {
                tracing::warn!(
                    group_id = %group,
                    correlation_id = %cid,
                    error = %e,
                    "target lookup failed during reconnect"
                );
                self.reconnect_failed(group, target, flags, scope);
                return;
            }
        };
        if scope.is_cancelled() {
            return;
        }

        let outcome = self
            .connect(group, resolved.clone(), flags, false, scope.clone())
            .await;
        match outcome {
            JoinOutcome::Joined { .. } => {
                let previous = self.breakers.record_success(group);
                if previous == CircuitState::HalfOpen {
                    // The trial attempt proved recovery.
                    self.attempts.lock().remove(group);
                    self.events.publish(SessionEvent::CircuitChanged {
                        group_id: group.clone(),
                        from: previous,
                        to: CircuitState::Closed,
                    });
                }
                tracing::info!(group_id = %group, attempt, "reconnected");
            }
            JoinOutcome::AlreadyJoined { .. } => {}
            JoinOutcome::Failed { failure } if failure.is_terminal() => {
                tracing::debug!(group_id = %group, failure = %failure, "reconnect abandoned");
            }
            JoinOutcome::Failed { failure } => {
                tracing::warn!(
                    group_id = %group,
                    attempt,
                    failure = %failure,
                    "reconnect attempt failed"
                );
                self.reconnect_failed(group, resolved, flags, scope);
            }
        }
    }

    fn reconnect_failed(
        &self,
        group: &GroupId,
        target: Target,
        flags: SessionFlags,
        scope: CancellationToken,
    ) {
        let (previous, current) = self.breakers.record_failure(group, Instant::now());
        if previous != current {
            self.events.publish(SessionEvent::CircuitChanged {
                group_id: group.clone(),
                from: previous,
                to: current,
            });
        }

        // Budget before breaker: a spent budget must not wait out a cooldown.
        let attempts = self.reconnect_attempts(group);
        if self.backoff.should_give_up(attempts) {
            let cid = self.correlation.get_or_create(group);
            self.give_up(group, attempts, &cid);
            return;
        }
        self.schedule_reconnect(group, target, flags, scope);
    }

    fn give_up(&self, group: &GroupId, attempts: u32, cid: &str) {
        tracing::error!(
            group_id = %group,
            correlation_id = %cid,
            attempts,
            "max reconnect attempts reached, giving up"
        );
        self.events.publish(SessionEvent::MaxAttemptsExceeded {
            group_id: group.clone(),
            attempts,
        });
        // Persisted settings stay: the next start retries the group.
        self.clear_group_state(group);
    }

    async fn target_gone(&self, group: &GroupId, target_id: &TargetId, cid: &str) {
        tracing::warn!(
            group_id = %group,
            correlation_id = %cid,
            target_id = %target_id,
            "target no longer exists, dropping group"
        );
        self.events.publish(SessionEvent::TargetGone {
            group_id: group.clone(),
            target_id: target_id.clone(),
        });
        self.clear_group_state(group);
        self.delete_persisted(group).await;
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Explicit stop
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Stop the group, live or reconnecting.  Returns whether anything was
    /// active.
    pub async fn disconnect(&self, group: &GroupId, remove_from_persistence: bool) -> bool {
        let cid = self.correlation.current(group);

        // Scope first: in-flight joins must see the stop before the
        // session disappears.
        self.timers.clear_group(group);
        let state = self.states.get(group);
        if state != ConnectionState::Idle {
            self.states
                .set(group, ConnectionState::Disconnecting, cid.as_deref());
        }
        let session = self.sessions.lock().remove(group);
        let had_intent = self.intents.lock().contains_key(group);
        let active = session.is_some() || had_intent || state != ConnectionState::Idle;

        if let Some(session) = &session {
            self.close_quietly(session.handle.as_ref()).await;
        }
        if remove_from_persistence {
            self.delete_persisted(group).await;
        }
        self.clear_group_state(group);

        if active {
            tracing::info!(
                group_id = %group,
                correlation_id = cid.as_deref().unwrap_or("-"),
                "disconnected"
            );
        }
        active
    }

    /// Forget everything about the group except persisted settings.
    fn clear_group_state(&self, group: &GroupId) {
        self.timers.clear_group(group);
        let cid = self.correlation.current(group);
        self.sessions.lock().remove(group);
        self.intents.lock().remove(group);
        self.attempts.lock().remove(group);
        self.breakers.remove(group);
        if matches!(
            self.states.get(group),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.states
                .set(group, ConnectionState::Disconnecting, cid.as_deref());
        }
        self.states.clear(group, cid.as_deref());
        self.correlation.clear(group);
        self.events.publish(SessionEvent::Cleared {
            group_id: group.clone(),
        });
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Presence updates
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Start forwarding the transport's presence updates.  Replaces a
    /// previously started listener.
    pub fn start_presence_listener(&self) {
        let mut rx = self.transport.subscribe();
        let me = self.me.clone();
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = rx.recv() => received,
                };
                match received {
                    Ok(event) => {
                        let Some(mgr) = me.upgrade() else { break };
                        mgr.on_presence_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "presence listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::debug!("presence stream closed");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.listener.lock().replace(handle.abort_handle()) {
            previous.abort();
        }
    }

    fn on_presence_event(&self, event: PresenceEvent) {
        if event.identity != self.config.identity {
            return;
        }
        let held = self
            .sessions
            .lock()
            .get(&event.group_id)
            .map(|s| s.target.id.clone());
        let Some(held) = held else { return };

        if event.is_departure() && event.before.as_ref() == Some(&held) {
            tracing::info!(
                group_id = %event.group_id,
                target_id = %held,
                "left target according to presence update"
            );
            let Some(mgr) = self.me.upgrade() else { return };
            self.timers.spawn_tracked(async move {
                mgr.handle_disconnect(&event.group_id, DisconnectReason::PresenceUpdate)
                    .await;
            });
        } else if event.is_move() {
            tracing::info!(
                group_id = %event.group_id,
                from = ?event.before.as_ref().map(TargetId::as_str),
                to = ?event.after.as_ref().map(TargetId::as_str),
                "moved between targets; heartbeat will reconcile"
            );
        }
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Startup & shutdown
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Restore every persisted, enabled session.  Records whose target is
    /// gone are deleted; lookup errors leave the record for next time.
    pub async fn initialize(&self) -> InitializeReport {
        let mut report = InitializeReport::default();
        let Some(store) = self.store.clone() else {
            tracing::info!("no settings store configured, sessions will not persist");
            return report;
        };

        let records = match store.get_all_enabled().await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(error = %e, "failed to load persisted sessions");
                return report;
            }
        };
        tracing::info!(count = records.len(), "restoring persisted sessions");

        let restores = records.into_iter().map(|record| {
            let store = store.clone();
            async move {
                let group = record.group_id.clone();
                let result = match self.transport.resolve_target(&record.target_id).await {
                    Ok(Some(target)) if target.group_id == record.group_id => {
                        match self.join(&group, target, record.flags, false).await {
                            Ok(JoinOutcome::Joined { .. } | JoinOutcome::AlreadyJoined { .. }) => {
                                Restore::Restored
                            }
                            Ok(JoinOutcome::Failed { failure }) => {
                                tracing::warn!(group_id = %group, failure = %failure, "restore failed");
                                Restore::Failed
                            }
                            Err(e) => {
                                tracing::warn!(group_id = %group, error = %e, "restore rejected");
                                Restore::Failed
                            }
                        }
                    }
                    Ok(_) => {
                        tracing::warn!(
                            group_id = %group,
                            target_id = %record.target_id,
                            "persisted target no longer exists, removing record"
                        );
                        if let Err(e) = store.delete_settings(&group).await {
                            tracing::warn!(group_id = %group, error = %e, "failed to delete stale record");
                        }
                        Restore::Removed
                    }
                    Err(e) => {
                        tracing::warn!(group_id = %group, error = %e, "target lookup failed, keeping record");
                        Restore::Skipped
                    }
                };
                (group, result)
            }
        });

        for (group, result) in join_all(restores).await {
            match result {
                Restore::Restored => report.restored.push(group),
                Restore::Failed => report.failed.push(group),
                Restore::Removed => report.removed.push(group),
                Restore::Skipped => report.skipped.push(group),
            }
        }

        tracing::info!(
            restored = report.restored.len(),
            failed = report.failed.len(),
            removed = report.removed.len(),
            skipped = report.skipped.len(),
            "restore finished"
        );
        report
    }

    /// Stop everything.  Idempotent.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::info!("shutting down session manager");
        self.shutdown.cancel();

        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
        self.timers.clear_all();

        let sessions: Vec<(GroupId, Session)> = self.sessions.lock().drain().collect();
        if self.config.close_sessions_on_shutdown {
            let timeout = self.config.close_timeout();
            let closes = sessions.iter().filter_map(|(group, session)| {
                let handle = session.handle.as_ref()?;
                Some(async move {
                    match tokio::time::timeout(timeout, self.transport.close_session(handle)).await {
                        Ok(Ok(())) => tracing::debug!(group_id = %group, "session closed"),
                        Ok(Err(e)) => {
                            tracing::warn!(group_id = %group, error = %e, "failed to close session")
                        }
                        Err(_) => tracing::warn!(group_id = %group, "session close timed out"),
                    }
                })
            });
            join_all(closes).await;
        } else if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "leaving sessions open for restart");
        }

        // Attempts already past their timer slot close their own handles.
        if !self.timers.drain(self.config.close_timeout()).await {
            tracing::warn!("in-flight session work did not finish before shutdown");
        }

        for group in self.states.groups() {
            let cid = self.correlation.current(&group);
            if self.states.get(&group) != ConnectionState::Disconnecting {
                self.states
                    .set(&group, ConnectionState::Disconnecting, cid.as_deref());
            }
        }
        self.states.clear_all();
        self.intents.lock().clear();
        self.attempts.lock().clear();
        self.breakers.clear();
        self.correlation.clear_all();
        tracing::info!("session manager stopped");
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Status
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub fn status(&self, group: &GroupId) -> Option<SessionStatus> {
        let state = self.states.get(group);
        let live = self.sessions.lock().get(group).map(|s| {
            (
                s.target.clone(),
                s.flags,
                s.joined_at,
                s.connected_at.elapsed().as_secs(),
            )
        });
        let (target, flags, joined_at, duration) = match live {
            Some((target, flags, joined_at, secs)) => (target, flags, Some(joined_at), Some(secs)),
            None => {
                let intent = self.intents.lock().get(group).cloned()?;
                (intent.target, intent.flags, None, None)
            }
        };

        Some(SessionStatus {
            group_id: group.clone(),
            group_name: target.group_name.clone(),
            state,
            target_id: target.id,
            target_name: target.name,
            flags,
            joined_at,
            duration_seconds: duration,
            reconnect_attempts: self.reconnect_attempts(group),
            circuit_state: self.breakers.state(group),
            correlation_id: self.correlation.current(group),
            heartbeat_active: self.timers.is_active(group, TimerKind::Heartbeat),
        })
    }

    pub fn status_all(&self) -> Vec<SessionStatus> {
        let mut groups: BTreeSet<GroupId> = self.sessions.lock().keys().cloned().collect();
        groups.extend(self.intents.lock().keys().cloned());
        groups.extend(self.states.groups());
        groups.iter().filter_map(|g| self.status(g)).collect()
    }

    pub fn is_connected(&self, group: &GroupId) -> bool {
        self.states.get(group) == ConnectionState::Connected
            && self.sessions.lock().contains_key(group)
    }

    pub fn state(&self, group: &GroupId) -> ConnectionState {
        self.states.get(group)
    }

    pub fn reconnect_attempts(&self, group: &GroupId) -> u32 {
        self.attempts.lock().get(group).copied().unwrap_or(0)
    }

    pub fn circuit_state(&self, group: &GroupId) -> CircuitState {
        self.breakers.state(group)
    }

    /// Number of live heartbeat and reconnect timers across all groups.
    pub fn active_timers(&self) -> usize {
        self.timers.active_count()
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Collaborator helpers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    async fn close_quietly(&self, handle: Option<&SessionHandle>) {
        let Some(handle) = handle else { return };
        if let Err(e) = self.transport.close_session(handle).await {
            tracing::debug!(session = %handle, error = %e, "close failed");
        }
    }

    async fn save_persisted(&self, group: &GroupId, target: &Target, flags: SessionFlags) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.save_settings(group, &target.id, true, flags).await {
            tracing::warn!(group_id = %group, error = %e, "failed to persist session settings");
        }
    }

    async fn delete_persisted(&self, group: &GroupId) {
        let Some(store) = &self.store else { return };
        match store.delete_settings(group).await {
            Ok(existed) => tracing::debug!(group_id = %group, existed, "persisted settings removed"),
            Err(e) => {
                tracing::warn!(group_id = %group, error = %e, "failed to delete persisted settings")
            }
        }
    }
}

fn validate_target(group: &GroupId, target: &Target) -> Result<(), SupervisorError> {
    if group.is_empty() {
        return Err(SupervisorError::InvalidTarget("group id is empty".into()));
    }
    if target.id.is_empty() {
        return Err(SupervisorError::InvalidTarget("target id is empty".into()));
    }
    if &target.group_id != group {
        return Err(SupervisorError::InvalidTarget(format!(
            "target {} belongs to group {}, not {}",
            target.id, target.group_id, group
        )));
    }
    Ok(())
}

/// Sleep for `delay` unless `scope` is cancelled first.  Returns whether
/// the full delay elapsed.
async fn sleep_unless_cancelled(scope: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = scope.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
