use async_trait::async_trait;
use pk_domain::{GroupId, SessionFlags, SessionSettings, TargetId};

use crate::error::StoreError;

/// Durable "desired session target per group".
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_all_enabled(&self) -> Result<Vec<SessionSettings>, StoreError>;

    /// Upsert the record for `group`.
    async fn save_settings(
        &self,
        group: &GroupId,
        target: &TargetId,
        enabled: bool,
        flags: SessionFlags,
    ) -> Result<(), StoreError>;

    /// Remove the record for `group`.  Returns whether one existed.
    async fn delete_settings(&self, group: &GroupId) -> Result<bool, StoreError>;
}
