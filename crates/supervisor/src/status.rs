use chrono::{DateTime, Utc};
use pk_domain::{GroupId, SessionFlags, TargetId};
use serde::Serialize;

use crate::circuit::CircuitState;
use crate::error::JoinFailure;
use crate::state::ConnectionState;

/// Point-in-time view of one group, for the command layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub group_id: GroupId,
    pub group_name: String,
    pub state: ConnectionState,
    pub target_id: TargetId,
    pub target_name: String,
    pub flags: SessionFlags,
    /// When the live session was committed; `None` without one.
    pub joined_at: Option<DateTime<Utc>>,
    /// Seconds since the live session was committed; `None` without one.
    pub duration_seconds: Option<u64>,
    pub reconnect_attempts: u32,
    pub circuit_state: CircuitState,
    pub correlation_id: Option<String>,
    pub heartbeat_active: bool,
}

impl SessionStatus {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Result of a join request that passed input validation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined { status: SessionStatus },
    AlreadyJoined { status: SessionStatus },
    Failed { failure: JoinFailure },
}

impl JoinOutcome {
    pub fn is_joined(&self) -> bool {
        matches!(self, Self::Joined { .. })
    }

    pub fn failure(&self) -> Option<&JoinFailure> {
        match self {
            Self::Failed { failure } => Some(failure),
            _ => None,
        }
    }
}
