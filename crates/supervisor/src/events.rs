//! Structured session lifecycle events.
//!
//! Every event is logged as a single `pk_event` JSON line and fanned out to
//! subscribers (status API, tests) over a broadcast channel.

use std::fmt;

use pk_domain::{GroupId, TargetId};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::circuit::CircuitState;
use crate::state::ConnectionState;

/// Why a live session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// Consecutive heartbeat polls did not find us on the target.
    HeartbeatFailure,
    /// The presence stream reported that we left the target.
    PresenceUpdate,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HeartbeatFailure => "heartbeat_failure",
            Self::PresenceUpdate => "presence_update",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum SessionEvent {
    StateChanged {
        group_id: GroupId,
        from: ConnectionState,
        to: ConnectionState,
        correlation_id: Option<String>,
    },
    Joined {
        group_id: GroupId,
        target_id: TargetId,
        correlation_id: String,
        /// The transport open timed out but presence confirmed the join.
        recovered_from_timeout: bool,
    },
    JoinFailed {
        group_id: GroupId,
        target_id: TargetId,
        reason: String,
    },
    HeartbeatMissed {
        group_id: GroupId,
        failures: u32,
        max_failures: u32,
    },
    Stabilized {
        group_id: GroupId,
        forgiven_attempts: u32,
    },
    Disconnected {
        group_id: GroupId,
        target_id: TargetId,
        reason: DisconnectReason,
    },
    ReconnectScheduled {
        group_id: GroupId,
        attempt: u32,
        delay_ms: u64,
    },
    CircuitChanged {
        group_id: GroupId,
        from: CircuitState,
        to: CircuitState,
    },
    CircuitRecheckScheduled {
        group_id: GroupId,
        delay_ms: u64,
    },
    TargetGone {
        group_id: GroupId,
        target_id: TargetId,
    },
    MaxAttemptsExceeded {
        group_id: GroupId,
        attempts: u32,
    },
    Cleared {
        group_id: GroupId,
    },
}

impl SessionEvent {
    pub fn group_id(&self) -> &GroupId {
        match self {
            Self::StateChanged { group_id, .. }
            | Self::Joined { group_id, .. }
            | Self::JoinFailed { group_id, .. }
            | Self::HeartbeatMissed { group_id, .. }
            | Self::Stabilized { group_id, .. }
            | Self::Disconnected { group_id, .. }
            | Self::ReconnectScheduled { group_id, .. }
            | Self::CircuitChanged { group_id, .. }
            | Self::CircuitRecheckScheduled { group_id, .. }
            | Self::TargetGone { group_id, .. }
            | Self::MaxAttemptsExceeded { group_id, .. }
            | Self::Cleared { group_id } => group_id,
        }
    }

    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(session_event = %json, "pk_event");
    }
}

/// Broadcast sender wrapper: logs, then publishes.
#[derive(Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn publish(&self, event: SessionEvent) {
        event.emit();
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_are_tagged() {
        let ev = SessionEvent::ReconnectScheduled {
            group_id: "g1".into(),
            attempt: 2,
            delay_ms: 7_500,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "ReconnectScheduled");
        assert_eq!(json["group_id"], "g1");
        assert_eq!(json["delay_ms"], 7_500);
    }

    #[test]
    fn disconnect_reason_snake_case() {
        let json = serde_json::to_value(DisconnectReason::HeartbeatFailure).unwrap();
        assert_eq!(json, "heartbeat_failure");
        assert_eq!(DisconnectReason::PresenceUpdate.to_string(), "presence_update");
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::Cleared {
            group_id: "g".into(),
        });
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.group_id().as_str(), "g");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.publish(SessionEvent::Cleared {
            group_id: "g".into(),
        });
    }
}
