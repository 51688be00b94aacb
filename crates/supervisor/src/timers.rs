//! Per-group timer slots and cancellation scopes.
//!
//! Each group has at most one live task per [`TimerKind`].  Scheduling a
//! new one aborts the previous task first.  A task that is about to run
//! its callback releases its own slot (generation-checked) so the
//! callback's cleanup cannot abort the task it is running on.
//!
//! Each group also owns a scope token, a child of the root shutdown token.
//! Explicit stops cancel the scope so in-flight joins and reconnects that
//! outlive the stop abort instead of resurrecting the group.
//!
//! Every task spawned here is tracked, including ones that already gave
//! up their slot, so shutdown can wait for them with [`TimerRegistry::drain`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use pk_domain::GroupId;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum TimerKind {
    Heartbeat,
    Reconnect,
}

impl TimerKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Heartbeat => "heartbeat",
            Self::Reconnect => "reconnect",
        }
    }
}

/// Identifies one scheduled task; handed to the task so it can release
/// its own registration.
#[derive(Debug, Clone)]
pub(crate) struct TimerId {
    pub(crate) group: GroupId,
    pub(crate) kind: TimerKind,
    generation: u64,
}

struct TimerEntry {
    generation: u64,
    handle: AbortHandle,
}

pub(crate) struct TimerRegistry {
    root: CancellationToken,
    scopes: Mutex<HashMap<GroupId, CancellationToken>>,
    timers: Mutex<HashMap<(GroupId, TimerKind), TimerEntry>>,
    next_generation: AtomicU64,
    tasks: TaskTracker,
}

impl TimerRegistry {
    pub(crate) fn new(root: CancellationToken) -> Self {
        Self {
            root,
            scopes: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            tasks: TaskTracker::new(),
        }
    }

    /// The group's current scope, created on first use.
    pub(crate) fn scope(&self, group: &GroupId) -> CancellationToken {
        self.scopes
            .lock()
            .entry(group.clone())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// Cancel the group's current scope and start a fresh one.
    pub(crate) fn renew_scope(&self, group: &GroupId) -> CancellationToken {
        let fresh = self.root.child_token();
        if let Some(old) = self.scopes.lock().insert(group.clone(), fresh.clone()) {
            old.cancel();
        }
        fresh
    }

    /// Spawn `task` in the `(group, kind)` slot, aborting whatever was
    /// there.  The future receives its [`TimerId`].
    pub(crate) fn schedule<F, Fut>(&self, group: &GroupId, kind: TimerKind, task: F) -> TimerId
    where
        F: FnOnce(TimerId) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = TimerId {
            group: group.clone(),
            kind,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        };

        let mut timers = self.timers.lock();
        if let Some(previous) = timers.remove(&(group.clone(), kind)) {
            previous.handle.abort();
            tracing::debug!(group_id = %group, timer = kind.as_str(), "replaced pending timer");
        }
        let handle = self.tasks.spawn(task(id.clone())).abort_handle();
        timers.insert(
            (group.clone(), kind),
            TimerEntry {
                generation: id.generation,
                handle,
            },
        );
        id
    }

    /// Drop the slot if it still belongs to `id`.  Does not abort.
    pub(crate) fn release(&self, id: &TimerId) -> bool {
        let mut timers = self.timers.lock();
        let key = (id.group.clone(), id.kind);
        match timers.get(&key) {
            Some(entry) if entry.generation == id.generation => {
                timers.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Abort the task in the slot, if any.
    pub(crate) fn cancel(&self, group: &GroupId, kind: TimerKind) -> bool {
        match self.timers.lock().remove(&(group.clone(), kind)) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_active(&self, group: &GroupId, kind: TimerKind) -> bool {
        self.timers.lock().contains_key(&(group.clone(), kind))
    }

    /// Cancel the group's scope and abort all of its timers.
    pub(crate) fn clear_group(&self, group: &GroupId) {
        if let Some(scope) = self.scopes.lock().remove(group) {
            scope.cancel();
        }
        self.cancel(group, TimerKind::Heartbeat);
        self.cancel(group, TimerKind::Reconnect);
    }

    pub(crate) fn clear_all(&self) {
        for (_, scope) in self.scopes.lock().drain() {
            scope.cancel();
        }
        for (_, entry) in self.timers.lock().drain() {
            entry.handle.abort();
        }
    }

    pub(crate) fn active_count(&self) -> usize {
        self.timers.lock().len()
    }

    /// Spawn work that belongs to no slot but must finish before shutdown
    /// completes.
    pub(crate) fn spawn_tracked<Fut>(&self, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Wait for every tracked task, at most `limit`.  Returns whether all
    /// of them finished.
    pub(crate) async fn drain(&self, limit: Duration) -> bool {
        self.tasks.close();
        tokio::time::timeout(limit, self.tasks.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn g() -> GroupId {
        GroupId::new("g")
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_aborts_previous() {
        let reg = TimerRegistry::new(CancellationToken::new());
        let fired = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let fired = fired.clone();
            reg.schedule(&g(), TimerKind::Reconnect, move |_| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(reg.active_count(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn release_is_generation_checked() {
        let reg = Arc::new(TimerRegistry::new(CancellationToken::new()));
        let first = reg.schedule(&g(), TimerKind::Heartbeat, |_| async {
            std::future::pending::<()>().await
        });
        let _second = reg.schedule(&g(), TimerKind::Heartbeat, |_| async {
            std::future::pending::<()>().await
        });
        assert!(!reg.release(&first));
        assert!(reg.is_active(&g(), TimerKind::Heartbeat));
    }

    #[tokio::test(start_paused = true)]
    async fn task_can_release_itself() {
        let reg = Arc::new(TimerRegistry::new(CancellationToken::new()));
        let r = reg.clone();
        reg.schedule(&g(), TimerKind::Reconnect, move |id| async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            r.release(&id);
            // Cancelling the slot now must not abort this task.
            r.cancel(&id.group, TimerKind::Reconnect);
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!reg.is_active(&g(), TimerKind::Reconnect));
    }

    #[tokio::test]
    async fn clear_group_cancels_scope_and_timers() {
        let reg = TimerRegistry::new(CancellationToken::new());
        let scope = reg.scope(&g());
        reg.schedule(&g(), TimerKind::Heartbeat, |_| async {
            std::future::pending::<()>().await
        });
        reg.clear_group(&g());
        assert!(scope.is_cancelled());
        assert!(!reg.is_active(&g(), TimerKind::Heartbeat));
        // A fresh scope is handed out afterwards.
        assert!(!reg.scope(&g()).is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_released_tasks() {
        let reg = Arc::new(TimerRegistry::new(CancellationToken::new()));
        let finished = Arc::new(AtomicUsize::new(0));
        let (r, f) = (reg.clone(), finished.clone());
        reg.schedule(&g(), TimerKind::Reconnect, move |id| async move {
            r.release(&id);
            tokio::time::sleep(Duration::from_secs(3)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;
        assert_eq!(reg.active_count(), 0);

        reg.clear_all();
        assert!(reg.drain(Duration::from_secs(5)).await);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_the_limit() {
        let reg = TimerRegistry::new(CancellationToken::new());
        reg.spawn_tracked(std::future::pending::<()>());
        assert!(!reg.drain(Duration::from_secs(1)).await);
    }

    #[test]
    fn renew_scope_cancels_previous() {
        let reg = TimerRegistry::new(CancellationToken::new());
        let old = reg.scope(&g());
        let fresh = reg.renew_scope(&g());
        assert!(old.is_cancelled());
        assert!(!fresh.is_cancelled());
    }

    #[test]
    fn root_cancellation_reaches_scopes() {
        let root = CancellationToken::new();
        let reg = TimerRegistry::new(root.clone());
        let scope = reg.scope(&g());
        root.cancel();
        assert!(scope.is_cancelled());
    }
}
