//! Presence service protocol: REST bodies and WebSocket event frames.
//!
//! The daemon talks to the presence service over plain JSON.  REST calls
//! open and close sessions and answer "where is this identity right now";
//! the WebSocket stream pushes unsolicited presence updates.

use pk_domain::{GroupId, PresenceEvent, SessionFlags, Target, TargetId};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// REST bodies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `POST /v1/groups/{group}/sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionRequest {
    pub target_id: String,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl OpenSessionRequest {
    pub fn new(target: &Target, flags: SessionFlags) -> Self {
        Self {
            target_id: target.id.to_string(),
            self_mute: flags.self_mute,
            self_deaf: flags.self_deaf,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub session_id: String,
}

/// `GET /v1/targets/{target}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: String,
    pub name: String,
    pub group_id: String,
    #[serde(default)]
    pub group_name: String,
    /// Non-joinable targets (wrong kind, no permission) resolve as absent.
    #[serde(default = "d_true")]
    pub joinable: bool,
}

impl TargetInfo {
    /// Convert into a domain [`Target`], or `None` when it cannot be joined.
    pub fn into_target(self) -> Option<Target> {
        if !self.joinable {
            return None;
        }
        Some(Target::new(self.id, self.name, self.group_id, self.group_name))
    }
}

/// `GET /v1/groups/{group}/members/{identity}/presence`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceResponse {
    #[serde(default)]
    pub target_id: Option<String>,
}

impl PresenceResponse {
    pub fn target(&self) -> Option<TargetId> {
        self.target_id.as_deref().map(TargetId::from)
    }
}

/// Error body returned by the service on non-2xx responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// WebSocket frame envelope on the events stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventFrame {
    /// Service → client: stream accepted.
    #[serde(rename = "hello")]
    Hello {
        server_version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<String>,
    },

    /// Service → client: an identity's presence changed in a group.
    #[serde(rename = "presence_update")]
    PresenceUpdate {
        group_id: String,
        identity: String,
        #[serde(default)]
        before: Option<String>,
        #[serde(default)]
        after: Option<String>,
    },

    /// Bidirectional: heartbeat.
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },

    /// Bidirectional: heartbeat response.
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

impl EventFrame {
    /// The domain event carried by a `presence_update` frame.
    pub fn into_presence_event(self) -> Option<PresenceEvent> {
        match self {
            Self::PresenceUpdate {
                group_id,
                identity,
                before,
                after,
            } => Some(PresenceEvent {
                group_id: GroupId::from(group_id),
                identity,
                before: before.map(TargetId::from),
                after: after.map(TargetId::from),
            }),
            _ => None,
        }
    }
}

fn d_true() -> bool {
    true
}
