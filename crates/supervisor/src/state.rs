//! Per-group connection state with guarded transitions.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use pk_domain::GroupId;
use serde::Serialize;

use crate::events::{EventBus, SessionEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
            Self::Reconnecting => "RECONNECTING",
        }
    }

    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Idle, Reconnecting)
                | (Connecting, Connected)
                | (Connecting, Idle)
                | (Connecting, Disconnecting)
                | (Connected, Disconnecting)
                | (Disconnecting, Reconnecting)
                | (Disconnecting, Idle)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnecting)
                | (Reconnecting, Idle)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current state of every group.  Groups not in the map are IDLE.
pub(crate) struct StateMachine {
    states: Mutex<HashMap<GroupId, ConnectionState>>,
    events: EventBus,
}

impl StateMachine {
    pub(crate) fn new(events: EventBus) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub(crate) fn get(&self, group: &GroupId) -> ConnectionState {
        self.states
            .lock()
            .get(group)
            .copied()
            .unwrap_or(ConnectionState::Idle)
    }

    /// Move `group` to `next`.  No-op when already there.  Returns whether
    /// a transition was recorded.
    pub(crate) fn set(
        &self,
        group: &GroupId,
        next: ConnectionState,
        correlation_id: Option<&str>,
    ) -> bool {
        let previous = {
            let mut states = self.states.lock();
            let previous = states.get(group).copied().unwrap_or(ConnectionState::Idle);
            if previous == next {
                return false;
            }
            if next == ConnectionState::Idle {
                states.remove(group);
            } else {
                states.insert(group.clone(), next);
            }
            previous
        };

        if previous.can_transition_to(next) {
            tracing::info!(
                group_id = %group,
                correlation_id = correlation_id.unwrap_or("-"),
                from = %previous,
                to = %next,
                "state transition"
            );
        } else {
            tracing::warn!(
                group_id = %group,
                correlation_id = correlation_id.unwrap_or("-"),
                from = %previous,
                to = %next,
                "unexpected state transition"
            );
        }

        self.events.publish(SessionEvent::StateChanged {
            group_id: group.clone(),
            from: previous,
            to: next,
            correlation_id: correlation_id.map(str::to_owned),
        });
        true
    }

    /// Forget the group, recording a transition to IDLE if it was elsewhere.
    pub(crate) fn clear(&self, group: &GroupId, correlation_id: Option<&str>) {
        self.set(group, ConnectionState::Idle, correlation_id);
    }

    pub(crate) fn groups(&self) -> Vec<GroupId> {
        self.states.lock().keys().cloned().collect()
    }

    pub(crate) fn clear_all(&self) {
        let groups = self.groups();
        for group in groups {
            self.clear(&group, None);
        }
    }
}
