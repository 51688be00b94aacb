use serde::Serialize;

/// Errors raised by a [`PresenceTransport`](crate::PresenceTransport).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The call did not complete in time.  For `open_session` the session
    /// may still have been established, so the caller validates anyway.
    #[error("transport timed out: {0}")]
    Timeout(String),

    /// The service refused the request (permissions, bad target, …).
    #[error("transport rejected request: {0}")]
    Rejected(String),

    /// The service could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The service answered with something we could not interpret.
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors raised by a [`SettingsStore`](crate::SettingsStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("store: {0}")]
    Backend(String),
}

/// Errors returned to callers of the session manager.
///
/// Everything else (transport failures, validation timeouts, drift) is an
/// expected outcome and is reported through [`JoinOutcome`](crate::JoinOutcome)
/// or handled internally.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("invalid target: {0}")]
    InvalidTarget(String),
}

/// Why a join did not produce a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum JoinFailure {
    #[error("could not open session: {0}")]
    TransportJoin(String),

    #[error("presence was not confirmed in time")]
    ValidationTimeout,

    #[error("shutting down")]
    ShuttingDown,

    /// An explicit stop (or a newer join) for the group landed while this
    /// attempt was in flight.
    #[error("superseded by a newer request for the group")]
    Superseded,
}

impl JoinFailure {
    /// Failures that end a reconnect lineage instead of counting against it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Superseded)
    }
}
