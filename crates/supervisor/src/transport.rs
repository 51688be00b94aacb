use std::fmt;

use async_trait::async_trait;
use pk_domain::{GroupId, PresenceEvent, SessionFlags, Target, TargetId};
use tokio::sync::broadcast;

use crate::error::TransportError;

/// Opaque handle of an open transport session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The external real-time service the manager keeps sessions against.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    /// Open a session on `target`.  A [`TransportError::Timeout`] means the
    /// outcome is unknown.
    async fn open_session(
        &self,
        target: &Target,
        flags: SessionFlags,
    ) -> Result<SessionHandle, TransportError>;

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), TransportError>;

    /// Look a target up.  `Ok(None)` means it no longer exists (or can no
    /// longer be joined).
    async fn resolve_target(&self, target_id: &TargetId) -> Result<Option<Target>, TransportError>;

    /// Where `identity` currently is inside `group`, per the authoritative
    /// state.
    async fn query_presence(
        &self,
        group: &GroupId,
        identity: &str,
    ) -> Result<Option<TargetId>, TransportError>;

    /// Unsolicited presence updates.
    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent>;
}
