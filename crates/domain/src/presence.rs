//! Identifiers and value types describing what a group should be attached to.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identifiers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stable external identifier of a group (the scoping unit of a session).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

/// Identifier of a target resource inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetId(String);

macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(GroupId);
string_id!(TargetId);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Targets & flags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Behavioral flags applied when a session is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFlags {
    #[serde(default = "d_true")]
    pub self_mute: bool,
    #[serde(default = "d_true")]
    pub self_deaf: bool,
}

impl Default for SessionFlags {
    fn default() -> Self {
        Self {
            self_mute: true,
            self_deaf: true,
        }
    }
}

fn d_true() -> bool {
    true
}

/// A resolved target resource: what a session attaches to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    pub name: String,
    pub group_id: GroupId,
    #[serde(default)]
    pub group_name: String,
}

impl Target {
    pub fn new(
        id: impl Into<TargetId>,
        name: impl Into<String>,
        group_id: impl Into<GroupId>,
        group_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            group_id: group_id.into(),
            group_name: group_name.into(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Presence updates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Unsolicited notification that an identity's presence changed in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub group_id: GroupId,
    pub identity: String,
    pub before: Option<TargetId>,
    pub after: Option<TargetId>,
}

impl PresenceEvent {
    /// The identity left its target and is now attached to nothing.
    pub fn is_departure(&self) -> bool {
        self.before.is_some() && self.after.is_none()
    }

    /// The identity moved from one target to another.
    pub fn is_move(&self) -> bool {
        matches!((&self.before, &self.after), (Some(b), Some(a)) if b != a)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persisted settings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable "desired session target" for one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    pub group_id: GroupId,
    pub target_id: TargetId,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub flags: SessionFlags,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_transparently() {
        let g = GroupId::new("123");
        assert_eq!(serde_json::to_string(&g).unwrap(), "\"123\"");
        let t: TargetId = serde_json::from_str("\"456\"").unwrap();
        assert_eq!(t.as_str(), "456");
    }

    #[test]
    fn blank_id_is_empty() {
        assert!(GroupId::new("  ").is_empty());
        assert!(!TargetId::new("1").is_empty());
    }

    #[test]
    fn flags_default_to_muted_and_deafened() {
        let flags: SessionFlags = serde_json::from_str("{}").unwrap();
        assert!(flags.self_mute);
        assert!(flags.self_deaf);
    }

    #[test]
    fn departure_and_move_detection() {
        let mut ev = PresenceEvent {
            group_id: "g".into(),
            identity: "me".into(),
            before: Some("a".into()),
            after: None,
        };
        assert!(ev.is_departure());
        assert!(!ev.is_move());

        ev.after = Some("b".into());
        assert!(!ev.is_departure());
        assert!(ev.is_move());

        ev.after = Some("a".into());
        assert!(!ev.is_move());
    }

    #[test]
    fn settings_flatten_flags() {
        let json = r#"{
            "group_id": "g1",
            "target_id": "t1",
            "self_mute": false,
            "updated_at": "2026-01-15T03:00:00Z"
        }"#;
        let s: SessionSettings = serde_json::from_str(json).unwrap();
        assert!(s.enabled);
        assert!(!s.flags.self_mute);
        assert!(s.flags.self_deaf);
    }
}
