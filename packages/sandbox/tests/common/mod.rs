// ABOUTME: Shared fixtures for lifecycle integration tests
// ABOUTME: In-memory container provider plus temporary bundle directories

#![allow(dead_code)]

use async_trait::async_trait;
use botyard_sandbox::providers::{
    ContainerConfig, ContainerInfo, ExitStatus, OutputChunk, OutputStream, Provider,
    ProviderError, Result, StreamType, BUNDLE_LABEL, RUN_LABEL,
};
use botyard_sandbox::{BotManager, BotState, BotStatus, BundleId, EngineSettings};
use chrono::Utc;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};

struct FakeContainer {
    config: ContainerConfig,
    output: Option<mpsc::UnboundedSender<OutputChunk>>,
    exit: watch::Sender<Option<ExitStatus>>,
    removed: bool,
}

impl FakeContainer {
    fn running(&self) -> bool {
        self.exit.borrow().is_none()
    }

    fn terminate(&mut self, status: ExitStatus) {
        if self.running() {
            self.output = None;
            self.exit.send_replace(Some(status));
        }
    }
}

/// Container provider that keeps everything in memory.
///
/// Containers run until the test calls `exit`, a stop arrives, or they are
/// force-removed.
#[derive(Default)]
pub struct FakeProvider {
    containers: Mutex<HashMap<String, FakeContainer>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    fail_create: AtomicBool,
    fail_stop: AtomicBool,
    ignore_sigterm: AtomicBool,
    create_delay: Mutex<Option<Duration>>,
    remove_delay: Mutex<Option<Duration>>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stops(&self, fail: bool) {
        self.fail_stop.store(fail, Ordering::SeqCst);
    }

    /// Simulate a bot that ignores SIGTERM so only the kill after the grace period ends it
    pub fn ignore_sigterm(&self, ignore: bool) {
        self.ignore_sigterm.store(ignore, Ordering::SeqCst);
    }

    /// Hold `create_container` open after the container exists, like a slow start
    pub fn delay_creates(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }

    pub fn delay_removes(&self, delay: Duration) {
        *self.remove_delay.lock().unwrap() = Some(delay);
    }

    /// Write output as the bot would
    pub fn emit(&self, container_id: &str, stream: StreamType, data: &str) {
        let containers = self.containers.lock().unwrap();
        let container = containers.get(container_id).expect("unknown container");
        if let Some(output) = &container.output {
            output
                .send(OutputChunk {
                    timestamp: Utc::now(),
                    stream,
                    data: data.as_bytes().to_vec(),
                })
                .unwrap();
        }
    }

    /// Make the bot exit on its own
    pub fn exit(&self, container_id: &str, code: i64) {
        let mut containers = self.containers.lock().unwrap();
        let container = containers.get_mut(container_id).expect("unknown container");
        container.terminate(ExitStatus::with_code(code));
    }

    pub fn is_running(&self, container_id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.running())
            .unwrap_or(false)
    }

    pub fn is_removed(&self, container_id: &str) -> bool {
        self.containers
            .lock()
            .unwrap()
            .get(container_id)
            .map(|c| c.removed)
            .unwrap_or(true)
    }

    pub fn running_count(&self) -> usize {
        self.containers
            .lock()
            .unwrap()
            .values()
            .filter(|c| c.running())
            .count()
    }

    pub fn running_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| c.running())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn config_of(&self, container_id: &str) -> ContainerConfig {
        self.containers.lock().unwrap()[container_id].config.clone()
    }

    /// Register a managed container this process never created
    pub fn add_orphan(&self, bundle_id: &str) -> String {
        let config = ContainerConfig {
            image: "node:20-alpine".to_string(),
            name: format!("botyard-{}-orphan", bundle_id),
            command: vec!["node".to_string(), "index.js".to_string()],
            working_dir: "/app".to_string(),
            mount: botyard_sandbox::providers::VolumeMount {
                host_path: "/tmp".to_string(),
                container_path: "/app".to_string(),
                readonly: false,
            },
            limits: botyard_sandbox::providers::ResourceLimits {
                memory_bytes: 0,
                max_processes: 0,
            },
            network_disabled: true,
            labels: HashMap::from([(BUNDLE_LABEL.to_string(), bundle_id.to_string())]),
        };
        self.insert(config)
    }

    fn insert(&self, config: ContainerConfig) -> String {
        let id = format!("fake-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (exit, _) = watch::channel(None);
        self.containers.lock().unwrap().insert(
            id.clone(),
            FakeContainer {
                config,
                output: None,
                exit,
                removed: false,
            },
        );
        id
    }
}

#[async_trait]
impl Provider for FakeProvider {
    async fn is_available(&self) -> Result<bool> {
        Ok(true)
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::ContainerError(
                "image not available".to_string(),
            ));
        }
        let id = self.insert(config.clone());
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(ProviderError::ConnectionError(
                "daemon unreachable".to_string(),
            ));
        }

        let status = if self.ignore_sigterm.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(timeout_secs)).await;
            ExitStatus::with_code(137)
        } else {
            ExitStatus::with_code(143)
        };

        if let Some(container) = self.containers.lock().unwrap().get_mut(container_id) {
            container.terminate(status);
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        let delay = *self.remove_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut containers = self.containers.lock().unwrap();
        if let Some(container) = containers.get_mut(container_id) {
            if container.running() {
                if !force {
                    return Err(ProviderError::ContainerError(
                        "container is running".to_string(),
                    ));
                }
                container.terminate(ExitStatus::with_code(137));
            }
            container.removed = true;
        }
        Ok(())
    }

    async fn stream_logs(&self, container_id: &str) -> Result<OutputStream> {
        let (tx, receiver) = mpsc::unbounded_channel();
        let mut containers = self.containers.lock().unwrap();
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| ProviderError::ContainerError("no such container".to_string()))?;
        if container.running() {
            container.output = Some(tx);
        }
        Ok(OutputStream { receiver })
    }

    async fn wait_container(&self, container_id: &str) -> Result<ExitStatus> {
        let mut exit = match self.containers.lock().unwrap().get(container_id) {
            Some(container) => container.exit.subscribe(),
            None => return Ok(ExitStatus::unknown("no such container")),
        };
        let status = exit
            .wait_for(|status| status.is_some())
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;
        Ok((*status).clone().unwrap_or_else(|| ExitStatus::unknown("no status")))
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| !c.removed)
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.config.name.clone(),
                bundle_id: c.config.labels.get(BUNDLE_LABEL).cloned(),
                run_id: c.config.labels.get(RUN_LABEL).cloned(),
                running: c.running(),
            })
            .collect())
    }
}

/// Temporary bundles root with b1 (runnable) and b2 (no entry point)
pub struct TestBundles {
    pub dir: TempDir,
}

impl TestBundles {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        write_file(&dir.path().join("b1"), "index.js", "console.log('hello')");
        write_file(&dir.path().join("b2"), "README.md", "# not runnable");
        Self { dir }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            stop_grace: Duration::from_secs(1),
            ..EngineSettings::with_bundles_root(self.root())
        }
    }
}

pub fn write_file(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn bundle(id: &str) -> BundleId {
    BundleId::new(id).unwrap()
}

pub fn setup() -> (TestBundles, Arc<FakeProvider>, BotManager) {
    let bundles = TestBundles::new();
    let provider = FakeProvider::new();
    let manager = BotManager::new(provider.clone(), bundles.settings());
    (bundles, provider, manager)
}

/// Poll status until `done` holds, failing after five seconds
pub async fn wait_for_status<F>(manager: &BotManager, bundle_id: &BundleId, done: F) -> BotStatus
where
    F: Fn(&BotStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = manager.status(bundle_id).await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("status condition not reached")
}

pub async fn wait_until_stopped(manager: &BotManager, bundle_id: &BundleId) -> BotStatus {
    wait_for_status(manager, bundle_id, |s| s.state == BotState::Stopped).await
}
