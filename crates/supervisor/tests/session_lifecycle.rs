//! End-to-end flows of the session manager against a scripted transport.
//!
//! Every test runs on paused tokio time, so multi-minute backoff and
//! heartbeat schedules complete instantly and deterministically.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::*;
use pk_domain::{GroupId, PresenceEvent, SessionFlags};
use pk_supervisor::{
    CircuitState, ConnectionState, DisconnectReason, JoinFailure, JoinOutcome, SessionEvent,
    SupervisorError,
};

async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

async fn join_lobby(h: &Harness) -> JoinOutcome {
    h.manager
        .join(&g1(), lobby(), SessionFlags::default(), true)
        .await
        .unwrap()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Join
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn first_try_join_commits_and_starts_heartbeat() {
    let h = harness();
    let outcome = join_lobby(&h).await;

    let JoinOutcome::Joined { status } = outcome else {
        panic!("expected Joined, got {outcome:?}");
    };
    assert_eq!(status.state, ConnectionState::Connected);
    assert_eq!(status.target_id.as_str(), "t1");
    assert_eq!(status.group_name, "Guild One");
    assert!(status.heartbeat_active);
    assert!(status.correlation_id.is_some());
    assert_eq!(status.duration_seconds, Some(0));
    assert_eq!(status.reconnect_attempts, 0);
    assert_eq!(status.circuit_state, CircuitState::Closed);

    assert!(h.manager.is_connected(&g1()));
    assert!(h.store.has("g1"));
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn validation_timeout_leaves_group_idle() {
    let h = harness();
    h.transport.set_follow_open(false);

    let outcome = join_lobby(&h).await;
    assert_eq!(outcome.failure(), Some(&JoinFailure::ValidationTimeout));

    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert!(h.manager.status(&g1()).is_none());
    assert_eq!(h.transport.presence_calls.load(Ordering::SeqCst), 4);
    assert_eq!(h.transport.closes(), 1);
    assert_eq!(h.manager.active_timers(), 0);
    assert!(!h.store.has("g1"));
}

#[tokio::test(start_paused = true)]
async fn rejected_open_fails_without_validation() {
    let h = harness();
    h.transport.set_open_mode(OpenMode::Reject);

    let outcome = join_lobby(&h).await;
    assert!(matches!(
        outcome.failure(),
        Some(JoinFailure::TransportJoin(_))
    ));
    assert_eq!(h.transport.presence_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
}

#[tokio::test(start_paused = true)]
async fn open_timeout_recovers_when_presence_confirms() {
    let h = harness();
    let mut rx = h.manager.subscribe();
    h.transport.set_open_mode(OpenMode::Timeout);

    let outcome = join_lobby(&h).await;
    assert!(outcome.is_joined(), "got {outcome:?}");
    assert!(h.manager.status(&g1()).unwrap().heartbeat_active);

    let recovered = drain(&mut rx).into_iter().any(|ev| {
        matches!(
            ev,
            SessionEvent::Joined {
                recovered_from_timeout: true,
                ..
            }
        )
    });
    assert!(recovered);
}

#[tokio::test(start_paused = true)]
async fn open_timeout_without_presence_fails() {
    let h = harness();
    h.transport.set_open_mode(OpenMode::Timeout);
    h.transport.set_follow_open(false);

    let outcome = join_lobby(&h).await;
    assert!(matches!(
        outcome.failure(),
        Some(JoinFailure::TransportJoin(_))
    ));
    // Nothing to close: no handle was ever returned.
    assert_eq!(h.transport.closes(), 0);
}

#[tokio::test(start_paused = true)]
async fn joining_same_target_twice_is_already_joined() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    let again = join_lobby(&h).await;
    assert!(matches!(again, JoinOutcome::AlreadyJoined { .. }));
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn joining_another_target_replaces_the_session() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    let outcome = h
        .manager
        .join(&g1(), stage(), SessionFlags::default(), true)
        .await
        .unwrap();
    assert!(outcome.is_joined());

    let status = h.manager.status(&g1()).unwrap();
    assert_eq!(status.target_id.as_str(), "t2");
    assert_eq!(h.transport.closes(), 1);
    assert_eq!(h.transport.opens(), 2);
    assert_eq!(h.manager.active_timers(), 1);
}

#[tokio::test(start_paused = true)]
async fn foreign_or_blank_targets_are_rejected() {
    let h = harness();
    let foreign = pk_domain::Target::new("t9", "Elsewhere", "g2", "Guild Two");
    let err = h
        .manager
        .join(&g1(), foreign, SessionFlags::default(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::InvalidTarget(_)));

    let err = h
        .manager
        .join_by_id(&g1(), &"missing".into(), SessionFlags::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not found"));
    assert_eq!(h.transport.opens(), 0);
}

#[tokio::test(start_paused = true)]
async fn join_by_id_resolves_and_persists() {
    let h = harness();
    let outcome = h
        .manager
        .join_by_id(&g1(), &"t2".into(), SessionFlags::default())
        .await
        .unwrap();
    assert!(outcome.is_joined());
    assert!(h.store.has("g1"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat & reconnect
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn three_heartbeat_misses_trigger_exactly_one_reconnect() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());
    let mut rx = h.manager.subscribe();

    // Misses land at t0, t0+30s and t0+60s.
    h.transport.clear_presence("g1");
    advance(45).await;
    assert_eq!(h.manager.state(&g1()), ConnectionState::Connected);

    advance(16).await;
    assert_eq!(h.manager.state(&g1()), ConnectionState::Reconnecting);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 1);

    let events = drain(&mut rx);
    let misses = events
        .iter()
        .filter(|ev| matches!(ev, SessionEvent::HeartbeatMissed { .. }))
        .count();
    let disconnects = events
        .iter()
        .filter(|ev| {
            matches!(
                ev,
                SessionEvent::Disconnected {
                    reason: DisconnectReason::HeartbeatFailure,
                    ..
                }
            )
        })
        .count();
    assert_eq!(misses, 3);
    assert_eq!(disconnects, 1);

    // The reconnect re-opens and validates.
    advance(20).await;
    assert!(h.manager.is_connected(&g1()));
    assert_eq!(h.transport.opens(), 2);
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn reconnect_logs_under_a_fresh_correlation_id() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());
    let lost = h.manager.status(&g1()).unwrap().correlation_id.unwrap();
    let mut rx = h.manager.subscribe();

    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;
    advance(30).await;
    assert!(h.manager.is_connected(&g1()));

    let events = drain(&mut rx);
    // Teardown of the lost session keeps its id.
    assert!(events.iter().any(|ev| matches!(
        ev,
        SessionEvent::StateChanged {
            to: ConnectionState::Disconnecting,
            correlation_id: Some(cid),
            ..
        } if *cid == lost
    )));
    let rejoined = events
        .iter()
        .find_map(|ev| match ev {
            SessionEvent::Joined { correlation_id, .. } => Some(correlation_id.clone()),
            _ => None,
        })
        .expect("reconnect publishes Joined");
    assert_ne!(rejoined, lost);
    assert_eq!(
        h.manager.status(&g1()).unwrap().correlation_id.as_deref(),
        Some(rejoined.as_str())
    );
}

#[tokio::test(start_paused = true)]
async fn recorded_transitions_follow_the_legal_table() {
    let h = harness();
    let mut rx = h.manager.subscribe();

    assert!(join_lobby(&h).await.is_joined());
    h.transport.clear_presence("g1");
    advance(90).await;
    h.manager.disconnect(&g1(), true).await;

    let transitions: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|ev| match ev {
            SessionEvent::StateChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert!(transitions.len() >= 6);
    for (from, to) in transitions {
        assert!(from.can_transition_to(to), "{from} -> {to}");
    }
}

#[tokio::test(start_paused = true)]
async fn breaker_opens_after_five_failed_reconnects() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.set_open_mode(OpenMode::Reject);
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;

    // Five backoff-spaced attempts finish well within 100s.
    advance(100).await;
    assert_eq!(h.transport.opens(), 6);
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Open);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Reconnecting);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 5);

    // Cooldown elapses, one half-open trial fails and re-opens the breaker.
    advance(200).await;
    assert_eq!(h.transport.opens(), 7);
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Open);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 6);
}

#[tokio::test(start_paused = true)]
async fn successful_trial_closes_breaker_and_resets_attempts() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.set_open_mode(OpenMode::Reject);
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;
    advance(100).await;
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Open);

    h.transport.set_open_mode(OpenMode::Succeed);
    advance(200).await;
    assert!(h.manager.is_connected(&g1()));
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Closed);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 0);
}

#[tokio::test(start_paused = true)]
async fn stable_connection_forgives_previous_attempts() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;
    advance(10).await;
    assert!(h.manager.is_connected(&g1()));
    assert_eq!(h.manager.reconnect_attempts(&g1()), 1);

    advance(125).await;
    assert_eq!(h.manager.reconnect_attempts(&g1()), 0);
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn stable_window_closes_a_breaker_left_open_by_failures() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.set_open_mode(OpenMode::Reject);
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;
    advance(100).await;
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Open);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 5);

    // An explicit join lands while the breaker is still open.
    h.transport.set_open_mode(OpenMode::Succeed);
    assert!(join_lobby(&h).await.is_joined());
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Open);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 5);

    advance(125).await;
    assert!(h.manager.is_connected(&g1()));
    assert_eq!(h.manager.circuit_state(&g1()), CircuitState::Closed);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 0);
}

#[tokio::test(start_paused = true)]
async fn target_deleted_while_reconnecting_drops_group_and_settings() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());
    assert!(h.store.has("g1"));

    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;
    assert_eq!(h.manager.state(&g1()), ConnectionState::Reconnecting);

    h.transport.remove_target("t1");
    advance(10).await;

    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert!(h.manager.status(&g1()).is_none());
    assert!(!h.store.has("g1"));
    assert_eq!(h.manager.active_timers(), 0);
    assert_eq!(h.transport.opens(), 1);
}

#[tokio::test(start_paused = true)]
async fn target_gone_at_disconnect_skips_reconnect() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.remove_target("t1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;

    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert!(!h.store.has("g1"));
    assert_eq!(h.manager.reconnect_attempts(&g1()), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_drop_group_but_keep_settings() {
    let mut cfg = config();
    cfg.backoff.max_attempts = 2;
    cfg.circuit.failure_threshold = 10;
    let h = harness_with(cfg);
    assert!(join_lobby(&h).await.is_joined());

    h.transport.set_open_mode(OpenMode::Reject);
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;
    advance(30).await;

    assert_eq!(h.transport.opens(), 3);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert!(h.manager.status(&g1()).is_none());
    assert_eq!(h.manager.active_timers(), 0);
    assert!(h.store.has("g1"));
}

#[tokio::test(start_paused = true)]
async fn last_attempt_opening_the_breaker_still_gives_up() {
    let mut cfg = config();
    cfg.backoff.max_attempts = 5;
    let h = harness_with(cfg);
    assert!(join_lobby(&h).await.is_joined());
    let mut rx = h.manager.subscribe();

    h.transport.set_open_mode(OpenMode::Reject);
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;

    // The fifth failure both spends the budget and trips the breaker.
    advance(100).await;
    assert_eq!(h.transport.opens(), 6);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert!(h.manager.status(&g1()).is_none());
    assert_eq!(h.manager.active_timers(), 0);
    assert!(h.store.has("g1"));

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|ev| matches!(ev, SessionEvent::MaxAttemptsExceeded { attempts: 5, .. })));
    assert!(!events
        .iter()
        .any(|ev| matches!(ev, SessionEvent::CircuitRecheckScheduled { .. })));

    // Nothing is left to wake up after the cooldown.
    advance(300).await;
    assert_eq!(h.transport.opens(), 6);
}

#[tokio::test(start_paused = true)]
async fn concurrent_disconnect_triggers_collapse_into_one() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());
    let mut rx = h.manager.subscribe();

    h.transport.clear_presence("g1");
    let id = g1();
    tokio::join!(
        h.manager
            .handle_disconnect(&id, DisconnectReason::HeartbeatFailure),
        h.manager
            .handle_disconnect(&id, DisconnectReason::PresenceUpdate),
    );

    assert_eq!(h.manager.reconnect_attempts(&g1()), 1);
    let disconnects = drain(&mut rx)
        .into_iter()
        .filter(|ev| matches!(ev, SessionEvent::Disconnected { .. }))
        .count();
    assert_eq!(disconnects, 1);
}

#[tokio::test(start_paused = true)]
async fn one_timer_per_group_and_purpose() {
    let h = harness();
    h.transport
        .add_target(pk_domain::Target::new("t5", "Hall", "g2", "Guild Two"));
    assert!(join_lobby(&h).await.is_joined());
    assert!(h
        .manager
        .join(
            &"g2".into(),
            pk_domain::Target::new("t5", "Hall", "g2", "Guild Two"),
            SessionFlags::default(),
            false,
        )
        .await
        .unwrap()
        .is_joined());
    assert_eq!(h.manager.active_timers(), 2);

    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;
    // g1: reconnect only; g2: heartbeat only.
    assert_eq!(h.manager.active_timers(), 2);
    assert!(!h.manager.status(&g1()).unwrap().heartbeat_active);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presence updates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn departure_update_triggers_reconnect() {
    let h = harness();
    h.manager.start_presence_listener();
    assert!(join_lobby(&h).await.is_joined());

    // Someone else leaving is irrelevant.
    h.transport.emit(PresenceEvent {
        group_id: g1(),
        identity: "someone-else".into(),
        before: Some("t1".into()),
        after: None,
    });
    advance(1).await;
    assert!(h.manager.is_connected(&g1()));

    h.transport.clear_presence("g1");
    h.transport.emit(PresenceEvent {
        group_id: g1(),
        identity: IDENTITY.into(),
        before: Some("t1".into()),
        after: None,
    });
    advance(1).await;
    assert_eq!(h.manager.state(&g1()), ConnectionState::Reconnecting);
    assert_eq!(h.manager.reconnect_attempts(&g1()), 1);
}

#[tokio::test(start_paused = true)]
async fn move_update_is_left_to_the_heartbeat() {
    let h = harness();
    h.manager.start_presence_listener();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.emit(PresenceEvent {
        group_id: g1(),
        identity: IDENTITY.into(),
        before: Some("t1".into()),
        after: Some("t2".into()),
    });
    advance(1).await;
    assert!(h.manager.is_connected(&g1()));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Explicit stop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn disconnect_removes_persisted_settings_on_request() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    assert!(h.manager.disconnect(&g1(), true).await);
    assert!(!h.store.has("g1"));
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert_eq!(h.transport.closes(), 1);
    assert_eq!(h.manager.active_timers(), 0);

    assert!(!h.manager.disconnect(&g1(), true).await);
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_settings_when_asked() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());
    assert!(h.manager.disconnect(&g1(), false).await);
    assert!(h.store.has("g1"));
}

#[tokio::test(start_paused = true)]
async fn disconnect_stops_a_reconnecting_group() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;
    assert_eq!(h.manager.state(&g1()), ConnectionState::Reconnecting);

    assert!(h.manager.disconnect(&g1(), false).await);
    advance(60).await;
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert_eq!(h.manager.active_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_during_join_supersedes_it() {
    let h = harness();
    let manager = h.manager.clone();
    let join = tokio::spawn(async move {
        manager
            .join(&g1(), lobby(), SessionFlags::default(), true)
            .await
            .unwrap()
    });

    // Mid propagation grace.
    advance(1).await;
    h.manager.disconnect(&g1(), false).await;

    let outcome = join.await.unwrap();
    assert_eq!(outcome.failure(), Some(&JoinFailure::Superseded));
    assert!(!h.manager.is_connected(&g1()));
    assert_eq!(h.manager.active_timers(), 0);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Startup & shutdown
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn initialize_restores_prunes_and_skips() {
    let h = harness();
    h.transport
        .add_target(pk_domain::Target::new("t3", "Den", "g3", "Guild Three"));
    h.transport.make_unresolvable("t3");
    h.store.seed("g1", "t1");
    h.store.seed("g2", "t-gone");
    h.store.seed("g3", "t3");

    let report = h.manager.initialize().await;
    assert_eq!(report.restored, vec![g1()]);
    assert_eq!(report.removed, vec![GroupId::new("g2")]);
    assert_eq!(report.skipped, vec![GroupId::new("g3")]);
    assert!(report.failed.is_empty());

    assert!(h.manager.is_connected(&g1()));
    assert!(!h.store.has("g2"));
    assert!(h.store.has("g3"));
}

#[tokio::test(start_paused = true)]
async fn initialize_without_store_is_empty() {
    let transport = FakeTransport::new();
    let manager = pk_supervisor::SessionManager::new(config(), transport, None);
    let report = manager.initialize().await;
    assert!(report.restored.is_empty() && report.removed.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_while_connected_suppresses_reconnection() {
    let h = harness();
    h.manager.start_presence_listener();
    assert!(join_lobby(&h).await.is_joined());

    h.manager.shutdown().await;
    assert!(h.manager.is_shutting_down());
    assert_eq!(h.transport.closes(), 1);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);
    assert!(h.manager.status_all().is_empty());
    assert_eq!(h.manager.active_timers(), 0);

    // Late disconnect notifications, pushed or direct, are ignored.
    h.transport.clear_presence("g1");
    h.transport.emit(PresenceEvent {
        group_id: g1(),
        identity: IDENTITY.into(),
        before: Some("t1".into()),
        after: None,
    });
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::PresenceUpdate)
        .await;
    advance(300).await;
    assert_eq!(h.transport.opens(), 1);
    assert_eq!(h.manager.active_timers(), 0);
    assert_eq!(h.manager.state(&g1()), ConnectionState::Idle);

    let outcome = join_lobby(&h).await;
    assert_eq!(outcome.failure(), Some(&JoinFailure::ShuttingDown));
    // Persisted settings survive for the next start.
    assert!(h.store.has("g1"));
}

#[tokio::test(start_paused = true)]
async fn shutdown_waits_for_an_in_flight_reconnect() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());

    h.transport.set_open_delay(Duration::from_secs(3));
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;
    assert_eq!(h.transport.closes(), 1);

    // The first backoff delay is at most 6.5s; the open is now pending.
    advance(7).await;
    assert_eq!(h.transport.opens(), 2);
    assert_eq!(h.manager.active_timers(), 0);

    h.manager.shutdown().await;
    // The reconnect's own handle was closed before shutdown returned.
    assert_eq!(h.transport.closes(), 2);
    assert!(!h.manager.is_connected(&g1()));
    assert!(h.manager.status_all().is_empty());
}

#[tokio::test(start_paused = true)]
async fn preserve_mode_leaves_sessions_open() {
    let mut cfg = config();
    cfg.close_sessions_on_shutdown = false;
    let h = harness_with(cfg);
    assert!(join_lobby(&h).await.is_joined());

    h.manager.shutdown().await;
    assert_eq!(h.transport.closes(), 0);
    assert_eq!(h.manager.active_timers(), 0);
}

#[tokio::test(start_paused = true)]
async fn status_all_lists_reconnecting_groups() {
    let h = harness();
    assert!(join_lobby(&h).await.is_joined());
    h.transport.clear_presence("g1");
    h.manager
        .handle_disconnect(&g1(), DisconnectReason::HeartbeatFailure)
        .await;

    let all = h.manager.status_all();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].state, ConnectionState::Reconnecting);
    assert_eq!(all[0].target_id.as_str(), "t1");
    assert!(all[0].duration_seconds.is_none());
    assert_eq!(all[0].reconnect_attempts, 1);
}
