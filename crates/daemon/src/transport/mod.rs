//! Presence service client: REST calls plus the WebSocket event stream.

pub mod events;
pub mod http;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub use events::EventStream;
pub use http::HttpPresenceTransport;

/// Shared flag tracking whether the event stream is currently attached.
#[derive(Debug, Clone, Default)]
pub struct StreamStatus(Arc<AtomicBool>);

impl StreamStatus {
    pub fn is_connected(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_connected(&self, connected: bool) {
        self.0.store(connected, Ordering::Relaxed);
    }
}
