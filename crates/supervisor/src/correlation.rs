//! Correlation ids tying together the log lines of one connection attempt.
//!
//! Every open (explicit join or reconnect) mints a fresh id.  The teardown
//! and reconnect scheduling that follow a loss log under the id of the
//! session that was lost.

use std::collections::HashMap;

use parking_lot::Mutex;
use pk_domain::GroupId;

#[derive(Default)]
pub(crate) struct CorrelationTracker {
    ids: Mutex<HashMap<GroupId, String>>,
}

impl CorrelationTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mint a fresh id for the group, replacing any previous one.
    pub(crate) fn reset(&self, group: &GroupId) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.ids.lock().insert(group.clone(), id.clone());
        id
    }

    pub(crate) fn current(&self, group: &GroupId) -> Option<String> {
        self.ids.lock().get(group).cloned()
    }

    /// The current id, minting one if the group has none yet.
    pub(crate) fn get_or_create(&self, group: &GroupId) -> String {
        self.ids
            .lock()
            .entry(group.clone())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    pub(crate) fn clear(&self, group: &GroupId) {
        self.ids.lock().remove(group);
    }

    pub(crate) fn clear_all(&self) {
        self.ids.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_replaces_id() {
        let t = CorrelationTracker::new();
        let g = GroupId::new("g");
        assert!(t.current(&g).is_none());
        let a = t.reset(&g);
        let b = t.reset(&g);
        assert_ne!(a, b);
        assert_eq!(t.current(&g).as_deref(), Some(b.as_str()));
    }

    #[test]
    fn get_or_create_is_stable() {
        let t = CorrelationTracker::new();
        let g = GroupId::new("g");
        let a = t.get_or_create(&g);
        assert_eq!(t.get_or_create(&g), a);
        t.clear(&g);
        assert!(t.current(&g).is_none());
    }
}
