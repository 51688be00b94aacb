//! In-memory collaborators for driving the session manager in tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use pk_domain::config::SupervisorConfig;
use pk_domain::{GroupId, PresenceEvent, SessionFlags, SessionSettings, Target, TargetId};
use pk_supervisor::{
    PresenceTransport, SessionEvent, SessionHandle, SessionManager, SettingsStore, StoreError,
    TransportError,
};
use tokio::sync::broadcast;

pub const IDENTITY: &str = "me";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Succeed,
    Reject,
    Timeout,
}

/// Scriptable presence service.
pub struct FakeTransport {
    presence: Mutex<HashMap<GroupId, TargetId>>,
    targets: Mutex<HashMap<TargetId, Target>>,
    unresolvable: Mutex<HashSet<TargetId>>,
    open_mode: Mutex<OpenMode>,
    open_delay: Mutex<Duration>,
    /// A successful (or timed-out) open moves the identity onto the target.
    follow_open: AtomicBool,
    next_handle: AtomicU64,
    pub open_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub presence_calls: AtomicUsize,
    events: broadcast::Sender<PresenceEvent>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            presence: Mutex::new(HashMap::new()),
            targets: Mutex::new(HashMap::new()),
            unresolvable: Mutex::new(HashSet::new()),
            open_mode: Mutex::new(OpenMode::Succeed),
            open_delay: Mutex::new(Duration::ZERO),
            follow_open: AtomicBool::new(true),
            next_handle: AtomicU64::new(1),
            open_calls: AtomicUsize::new(0),
            close_calls: AtomicUsize::new(0),
            presence_calls: AtomicUsize::new(0),
            events,
        })
    }

    pub fn add_target(&self, target: Target) {
        self.targets.lock().insert(target.id.clone(), target);
    }

    pub fn remove_target(&self, id: &str) {
        self.targets.lock().remove(&TargetId::from(id));
    }

    pub fn make_unresolvable(&self, id: &str) {
        self.unresolvable.lock().insert(TargetId::from(id));
    }

    pub fn set_open_mode(&self, mode: OpenMode) {
        *self.open_mode.lock() = mode;
    }

    /// Make every open take `delay` before answering.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = delay;
    }

    pub fn set_follow_open(&self, follow: bool) {
        self.follow_open.store(follow, Ordering::SeqCst);
    }

    pub fn clear_presence(&self, group: &str) {
        self.presence.lock().remove(&GroupId::from(group));
    }

    pub fn emit(&self, event: PresenceEvent) {
        let _ = self.events.send(event);
    }

    pub fn opens(&self) -> usize {
        self.open_calls.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    fn move_onto(&self, target: &Target) {
        if self.follow_open.load(Ordering::SeqCst) {
            self.presence
                .lock()
                .insert(target.group_id.clone(), target.id.clone());
        }
    }
}

#[async_trait]
impl PresenceTransport for FakeTransport {
    async fn open_session(
        &self,
        target: &Target,
        _flags: SessionFlags,
    ) -> Result<SessionHandle, TransportError> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mode = *self.open_mode.lock();
        match mode {
            OpenMode::Succeed => {
                self.move_onto(target);
                let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
                Ok(SessionHandle::new(format!("sess-{n}")))
            }
            OpenMode::Reject => Err(TransportError::Rejected("target is full".into())),
            OpenMode::Timeout => {
                self.move_onto(target);
                Err(TransportError::Timeout("open".into()))
            }
        }
    }

    async fn close_session(&self, _handle: &SessionHandle) -> Result<(), TransportError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resolve_target(&self, target_id: &TargetId) -> Result<Option<Target>, TransportError> {
        if self.unresolvable.lock().contains(target_id) {
            return Err(TransportError::Unavailable("lookup failed".into()));
        }
        Ok(self.targets.lock().get(target_id).cloned())
    }

    async fn query_presence(
        &self,
        group: &GroupId,
        identity: &str,
    ) -> Result<Option<TargetId>, TransportError> {
        self.presence_calls.fetch_add(1, Ordering::SeqCst);
        if identity != IDENTITY {
            return Ok(None);
        }
        Ok(self.presence.lock().get(group).cloned())
    }

    fn subscribe(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }
}

/// Settings kept in a map.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<GroupId, SessionSettings>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, group: &str, target: &str) {
        self.records.lock().insert(
            GroupId::from(group),
            SessionSettings {
                group_id: GroupId::from(group),
                target_id: TargetId::from(target),
                enabled: true,
                flags: SessionFlags::default(),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn has(&self, group: &str) -> bool {
        self.records.lock().contains_key(&GroupId::from(group))
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get_all_enabled(&self) -> Result<Vec<SessionSettings>, StoreError> {
        let mut all: Vec<_> = self
            .records
            .lock()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        Ok(all)
    }

    async fn save_settings(
        &self,
        group: &GroupId,
        target: &TargetId,
        enabled: bool,
        flags: SessionFlags,
    ) -> Result<(), StoreError> {
        self.records.lock().insert(
            group.clone(),
            SessionSettings {
                group_id: group.clone(),
                target_id: target.clone(),
                enabled,
                flags,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn delete_settings(&self, group: &GroupId) -> Result<bool, StoreError> {
        Ok(self.records.lock().remove(group).is_some())
    }
}

// ── fixtures ────────────────────────────────────────────────────────

pub fn config() -> SupervisorConfig {
    SupervisorConfig {
        identity: IDENTITY.into(),
        ..Default::default()
    }
}

pub fn lobby() -> Target {
    Target::new("t1", "Lobby", "g1", "Guild One")
}

pub fn stage() -> Target {
    Target::new("t2", "Stage", "g1", "Guild One")
}

pub fn g1() -> GroupId {
    GroupId::new("g1")
}

pub struct Harness {
    pub transport: Arc<FakeTransport>,
    pub store: Arc<MemoryStore>,
    pub manager: Arc<SessionManager>,
}

pub fn harness_with(config: SupervisorConfig) -> Harness {
    let transport = FakeTransport::new();
    transport.add_target(lobby());
    transport.add_target(stage());
    let store = MemoryStore::new();
    let manager = SessionManager::new(
        config,
        transport.clone(),
        Some(store.clone() as Arc<dyn SettingsStore>),
    );
    Harness {
        transport,
        store,
        manager,
    }
}

pub fn harness() -> Harness {
    harness_with(config())
}

/// Everything currently buffered on the receiver.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}
