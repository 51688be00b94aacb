//! `pk-domain`: types shared by every presence-keeper crate.
//!
//! Holds the identifiers and value types that cross crate boundaries
//! (groups, targets, session flags, presence events) and the TOML
//! configuration tree.

pub mod config;
pub mod presence;

pub use presence::{GroupId, PresenceEvent, SessionFlags, SessionSettings, Target, TargetId};
