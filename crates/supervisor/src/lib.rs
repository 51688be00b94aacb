//! `pk-supervisor`: keeps one presence session per group alive.
//!
//! ```text
//!   command layer ──► SessionManager ──► PresenceTransport (open/close/query)
//!                        │   ▲
//!          ┌─────────────┤   └── presence updates (broadcast)
//!          ▼             ▼
//!    StateMachine   CircuitBreakers ── BackoffPolicy
//!          │             │
//!          └── TimerRegistry (heartbeat / reconnect per group)
//! ```
//!
//! A join is only committed after the authoritative presence confirms it.
//! Once connected, a heartbeat polls presence; drift or a departure event
//! tears the session down and, if the circuit breaker allows, schedules a
//! backoff-delayed reconnect.  Explicit stops and shutdown cancel every
//! timer and in-flight attempt of the affected groups.

pub mod backoff;
pub mod circuit;
pub mod correlation;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod manager;
pub mod state;
pub mod status;
pub mod store;
pub mod timers;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use circuit::{CircuitBreakers, CircuitState};
pub use error::{JoinFailure, StoreError, SupervisorError, TransportError};
pub use events::{DisconnectReason, SessionEvent};
pub use manager::{InitializeReport, SessionManager};
pub use state::ConnectionState;
pub use status::{JoinOutcome, SessionStatus};
pub use store::SettingsStore;
pub use transport::{PresenceTransport, SessionHandle};
