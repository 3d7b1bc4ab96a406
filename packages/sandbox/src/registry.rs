// ABOUTME: Process-wide registry of bot instances keyed by bundle identifier
// ABOUTME: Each instance owns its transition lock, state snapshot, log buffer and run tasks

use crate::bundle::BundleId;
use crate::logs::LogBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use uuid::Uuid;

/// Lifecycle state of a bundle's sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BotState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl BotState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotState::Stopped => "stopped",
            BotState::Starting => "starting",
            BotState::Running => "running",
            BotState::Stopping => "stopping",
        }
    }
}

/// Identity of one sandbox run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub container_id: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
}

/// Consistent view of state and handle, taken under one lock
#[derive(Debug, Clone)]
pub struct InstanceSnapshot {
    pub state: BotState,
    pub handle: Option<SandboxHandle>,
}

/// Background tasks serving one run
pub(crate) struct RunTasks {
    pub run_id: Uuid,
    pub reader: AbortHandle,
    pub watcher: JoinHandle<()>,
}

/// Per-bundle record held by the registry
pub struct BotInstance {
    bundle_id: BundleId,
    transition: Arc<Mutex<()>>,
    snapshot: StdRwLock<InstanceSnapshot>,
    logs: Arc<LogBuffer>,
    tasks: StdMutex<Option<RunTasks>>,
    retired: AtomicBool,
}

impl BotInstance {
    pub fn new(bundle_id: BundleId, logs: Arc<LogBuffer>) -> Self {
        Self {
            bundle_id,
            transition: Arc::new(Mutex::new(())),
            snapshot: StdRwLock::new(InstanceSnapshot {
                state: BotState::Stopped,
                handle: None,
            }),
            logs,
            tasks: StdMutex::new(None),
            retired: AtomicBool::new(false),
        }
    }

    pub fn bundle_id(&self) -> &BundleId {
        &self.bundle_id
    }

    pub fn logs(&self) -> &Arc<LogBuffer> {
        &self.logs
    }

    /// Serialises start, stop, restart and delete for this bundle.
    ///
    /// The guard is owned so a spawned launch can keep holding it after the
    /// caller has gone away.
    pub async fn lock_transition(&self) -> OwnedMutexGuard<()> {
        self.transition.clone().lock_owned().await
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        self.snapshot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn state(&self) -> BotState {
        self.snapshot().state
    }

    pub fn set_state(&self, state: BotState) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshot.state = state;
        if state == BotState::Stopped {
            snapshot.handle = None;
        }
    }

    pub fn begin_run(&self, handle: SandboxHandle) {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        snapshot.state = BotState::Running;
        snapshot.handle = Some(handle);
    }

    /// Move to `Stopping` if `run_id` is still the current run.
    ///
    /// Returns false when the run already ended on its own.
    pub fn begin_stop(&self, run_id: Uuid) -> bool {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &snapshot.handle {
            Some(handle) if handle.run_id == run_id => {
                snapshot.state = BotState::Stopping;
                true
            }
            _ => false,
        }
    }

    /// Move to `Stopped` if `run_id` is still the current run.
    ///
    /// Returns false when another path already finished this run, so the
    /// exit watcher and an operator stop never both clear it.
    pub fn finish_run(&self, run_id: Uuid) -> bool {
        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match &snapshot.handle {
            Some(handle) if handle.run_id == run_id => {
                snapshot.state = BotState::Stopped;
                snapshot.handle = None;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn store_tasks(&self, tasks: RunTasks) {
        *self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tasks);
    }

    pub(crate) fn take_tasks(&self) -> Option<RunTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Mark the instance as removed from the registry
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// A retired instance belongs to a deleted bundle and must not start again
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }
}

/// Mapping from bundle identifier to its instance
pub struct BotRegistry {
    instances: RwLock<HashMap<BundleId, Arc<BotInstance>>>,
    log_capacity: usize,
    log_replay_lines: usize,
}

impl BotRegistry {
    pub fn new(log_capacity: usize, log_replay_lines: usize) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            log_capacity,
            log_replay_lines,
        }
    }

    pub async fn get(&self, bundle_id: &BundleId) -> Option<Arc<BotInstance>> {
        self.instances.read().await.get(bundle_id).cloned()
    }

    /// Fetch the instance for `bundle_id`, creating a stopped one on first reference
    pub async fn get_or_create(&self, bundle_id: &BundleId) -> Arc<BotInstance> {
        if let Some(instance) = self.get(bundle_id).await {
            return instance;
        }

        let mut instances = self.instances.write().await;
        instances
            .entry(bundle_id.clone())
            .or_insert_with(|| {
                Arc::new(BotInstance::new(
                    bundle_id.clone(),
                    Arc::new(LogBuffer::new(self.log_capacity, self.log_replay_lines)),
                ))
            })
            .clone()
    }

    /// Remove `bundle_id` only if it still maps to `instance`
    pub async fn remove(&self, bundle_id: &BundleId, instance: &Arc<BotInstance>) -> bool {
        let mut instances = self.instances.write().await;
        match instances.get(bundle_id) {
            Some(current) if Arc::ptr_eq(current, instance) => {
                instances.remove(bundle_id);
                true
            }
            _ => false,
        }
    }

    pub async fn list(&self) -> Vec<Arc<BotInstance>> {
        let mut instances: Vec<_> = self.instances.read().await.values().cloned().collect();
        instances.sort_by(|a, b| a.bundle_id().cmp(b.bundle_id()));
        instances
    }

    /// Container ids of every run this process currently tracks
    pub async fn tracked_containers(&self) -> Vec<String> {
        self.instances
            .read()
            .await
            .values()
            .filter_map(|instance| instance.snapshot().handle.map(|h| h.container_id))
            .collect()
    }

    /// Bundles whose sandbox is being created and not yet tracked
    pub async fn starting_bundles(&self) -> Vec<BundleId> {
        self.instances
            .read()
            .await
            .values()
            .filter(|instance| instance.state() == BotState::Starting)
            .map(|instance| instance.bundle_id().clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(container_id: &str) -> SandboxHandle {
        SandboxHandle {
            container_id: container_id.to_string(),
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    fn bundle(id: &str) -> BundleId {
        BundleId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let registry = BotRegistry::new(10, 5);
        let a = registry.get_or_create(&bundle("b1")).await;
        let b = registry.get_or_create(&bundle("b1")).await;

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.state(), BotState::Stopped);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_finish_run_only_clears_matching_run() {
        let registry = BotRegistry::new(10, 5);
        let instance = registry.get_or_create(&bundle("b1")).await;

        let first = handle("c1");
        instance.begin_run(first.clone());
        assert!(instance.finish_run(first.run_id));
        assert!(!instance.finish_run(first.run_id));

        let second = handle("c2");
        instance.begin_run(second.clone());
        // A late watcher from the first run must not clear the second
        assert!(!instance.finish_run(first.run_id));
        let snapshot = instance.snapshot();
        assert_eq!(snapshot.state, BotState::Running);
        assert_eq!(snapshot.handle, Some(second));
    }

    #[tokio::test]
    async fn test_begin_stop_after_exit_is_refused() {
        let registry = BotRegistry::new(10, 5);
        let instance = registry.get_or_create(&bundle("b1")).await;
        let run = handle("c1");
        instance.begin_run(run.clone());

        assert!(instance.finish_run(run.run_id));
        assert!(!instance.begin_stop(run.run_id));
        assert_eq!(instance.state(), BotState::Stopped);
    }

    #[tokio::test]
    async fn test_stopped_clears_handle() {
        let registry = BotRegistry::new(10, 5);
        let instance = registry.get_or_create(&bundle("b1")).await;
        instance.begin_run(handle("c1"));

        instance.set_state(BotState::Stopping);
        assert!(instance.snapshot().handle.is_some());

        instance.set_state(BotState::Stopped);
        assert!(instance.snapshot().handle.is_none());
    }

    #[tokio::test]
    async fn test_remove_checks_identity() {
        let registry = BotRegistry::new(10, 5);
        let id = bundle("b1");
        let stale = registry.get_or_create(&id).await;
        assert!(registry.remove(&id, &stale).await);

        let fresh = registry.get_or_create(&id).await;
        assert!(!registry.remove(&id, &stale).await);
        assert!(Arc::ptr_eq(&registry.get(&id).await.unwrap(), &fresh));
    }

    #[tokio::test]
    async fn test_tracked_containers_and_list_order() {
        let registry = BotRegistry::new(10, 5);
        let b2 = registry.get_or_create(&bundle("b2")).await;
        registry.get_or_create(&bundle("b1")).await;
        b2.begin_run(handle("c2"));

        assert_eq!(registry.tracked_containers().await, vec!["c2".to_string()]);
        assert!(registry.starting_bundles().await.is_empty());

        let b1 = registry.get(&bundle("b1")).await.unwrap();
        b1.set_state(BotState::Starting);
        assert_eq!(registry.starting_bundles().await, vec![bundle("b1")]);
        let ids: Vec<_> = registry
            .list()
            .await
            .iter()
            .map(|i| i.bundle_id().to_string())
            .collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[test]
    fn test_state_serialization() {
        assert_eq!(
            serde_json::to_string(&BotState::Running).unwrap(),
            "\"running\""
        );
        assert_eq!(BotState::Stopping.as_str(), "stopping");
    }
}
