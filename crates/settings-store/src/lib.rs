//! JSON-file settings store.
//!
//! Keeps every group's desired session in memory and rewrites
//! `presence_settings.json` after each mutation.  The file is an object
//! keyed by group id:
//!
//! ```json
//! { "g1": { "group_id": "g1", "target_id": "t1", "enabled": true,
//!           "self_mute": true, "self_deaf": true,
//!           "updated_at": "2024-05-01T12:00:00Z" } }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use pk_domain::{GroupId, SessionFlags, SessionSettings, TargetId};
use pk_supervisor::{SettingsStore, StoreError};

type Records = BTreeMap<GroupId, SessionSettings>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Settings store backed by a single JSON file.
pub struct JsonSettingsStore {
    path: PathBuf,
    records: RwLock<Records>,
    /// Serializes file writes so the last mutation always lands last.
    write_gate: tokio::sync::Mutex<()>,
}

impl JsonSettingsStore {
    /// Load the store at `path`, creating parent directories.  A missing
    /// file is an empty store; an unreadable or corrupt one is an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let records: Records = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            if raw.trim().is_empty() {
                Records::new()
            } else {
                serde_json::from_str(&raw)?
            }
        } else {
            Records::new()
        };

        tracing::info!(
            records = records.len(),
            path = %path.display(),
            "settings store loaded"
        );

        Ok(Self {
            path,
            records: RwLock::new(records),
            write_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up the record for one group, enabled or not.
    pub fn get(&self, group: &GroupId) -> Option<SessionSettings> {
        self.records.read().get(group).cloned()
    }

    /// Every record, ordered by group id.
    pub fn list(&self) -> Vec<SessionSettings> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Persist the current records to disk.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        let json = {
            let records = self.records.read();
            serde_json::to_string_pretty(&*records)?
        };
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomic(&path, json.as_bytes()))
            .await
            .map_err(|e| StoreError::Backend(format!("store writer panicked: {e}")))??;
        Ok(())
    }

    /// Put one group back the way it was before a write that failed to flush.
    fn restore(&self, group: &GroupId, previous: Option<SessionSettings>) {
        let mut records = self.records.write();
        match previous {
            Some(record) => {
                records.insert(group.clone(), record);
            }
            None => {
                records.remove(group);
            }
        }
        tracing::warn!(group_id = %group, "settings write not persisted, change rolled back");
    }
}

#[async_trait]
impl SettingsStore for JsonSettingsStore {
    async fn get_all_enabled(&self) -> Result<Vec<SessionSettings>, StoreError> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect())
    }

    async fn save_settings(
        &self,
        group: &GroupId,
        target: &TargetId,
        enabled: bool,
        flags: SessionFlags,
    ) -> Result<(), StoreError> {
        let previous = self.records.write().insert(
            group.clone(),
            SessionSettings {
                group_id: group.clone(),
                target_id: target.clone(),
                enabled,
                flags,
                updated_at: Utc::now(),
            },
        );
        if let Err(e) = self.flush().await {
            self.restore(group, previous);
            return Err(e);
        }
        tracing::debug!(group_id = %group, target_id = %target, enabled, "settings saved");
        Ok(())
    }

    async fn delete_settings(&self, group: &GroupId) -> Result<bool, StoreError> {
        let Some(removed) = self.records.write().remove(group) else {
            return Ok(false);
        };
        if let Err(e) = self.flush().await {
            self.restore(group, Some(removed));
            return Err(e);
        }
        tracing::debug!(group_id = %group, "settings deleted");
        Ok(true)
    }
}

/// Write through a sibling temp file so a crash never leaves half a file.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
