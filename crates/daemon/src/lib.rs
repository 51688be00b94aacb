//! `pk-daemon`: the `presence-keeper` binary's building blocks.
//!
//! Wires the session supervisor to the HTTP/WebSocket presence service,
//! the JSON settings store, and a small status API.

pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod state;
pub mod transport;
