// ABOUTME: Bot lifecycle manager driving sandbox runs for uploaded bundles
// ABOUTME: Serialises start/stop/restart/delete per bundle and wires container output into log buffers

use crate::bundle::BundleId;
use crate::error::{EngineError, Result};
use crate::guard;
use crate::logs::{LineSplitter, LogBuffer, LogSource, LogSubscription, SubscriptionId};
use crate::providers::{
    ContainerConfig, ExitStatus, OutputStream, Provider, ResourceLimits, StreamType,
    VolumeMount, BUNDLE_LABEL, MANAGED_LABEL, RUN_LABEL,
};
use crate::registry::{BotInstance, BotRegistry, BotState, RunTasks, SandboxHandle};
use crate::resolver::EntryPointResolver;
use crate::settings::{EngineSettings, CONTAINER_WORKDIR};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Point-in-time view of one bundle
#[derive(Debug, Clone, Serialize)]
pub struct BotStatus {
    pub bundle_id: BundleId,
    pub state: BotState,
    pub running: bool,
    pub handle: Option<SandboxHandle>,
    pub log_lines: usize,
}

/// Outcome of an orphan sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Managed containers not tracked by this process
    pub orphaned: Vec<String>,
    /// Orphans that were removed
    pub removed: Vec<String>,
    pub errors: Vec<String>,
}

/// Owns every bundle's lifecycle and log stream
#[derive(Clone)]
pub struct BotManager {
    provider: Arc<dyn Provider>,
    registry: Arc<BotRegistry>,
    resolver: Arc<EntryPointResolver>,
    settings: Arc<EngineSettings>,
}

impl BotManager {
    pub fn new(provider: Arc<dyn Provider>, settings: EngineSettings) -> Self {
        Self {
            provider,
            registry: Arc::new(BotRegistry::new(
                settings.log_capacity,
                settings.log_replay_lines,
            )),
            resolver: Arc::new(EntryPointResolver::from_settings(&settings)),
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &EntryPointResolver {
        &self.resolver
    }

    /// Directory holding the bundle's files
    pub fn bundle_root(&self, bundle_id: &BundleId) -> PathBuf {
        self.settings.bundles_root.join(bundle_id.as_str())
    }

    /// Whether the container runtime can be reached
    pub async fn runtime_available(&self) -> bool {
        match self.provider.is_available().await {
            Ok(available) => available,
            Err(e) => {
                debug!("Sandbox runtime availability check failed: {}", e);
                false
            }
        }
    }

    /// Start the bundle's sandbox.
    ///
    /// Starting a bundle that is already running returns the existing handle
    /// without creating a second sandbox.
    ///
    /// # Errors
    ///
    /// * `EngineError::NotFound` - the bundle directory does not exist
    /// * `EngineError::NoEntryPoint` - nothing runnable at the bundle root
    /// * `EngineError::RuntimeFailure` - the container could not be created or started
    pub async fn start(&self, bundle_id: &BundleId) -> Result<SandboxHandle> {
        let instance = self.instance_for(bundle_id).await?;
        let transition = instance.lock_transition().await;
        self.start_locked(&instance, transition).await
    }

    /// Stop the bundle's sandbox.
    ///
    /// The instance always ends up `Stopped`. A stop the runtime rejected is
    /// reported after that, and the container is force-removed regardless.
    pub async fn stop(&self, bundle_id: &BundleId) -> Result<()> {
        let Some(instance) = self.registry.get(bundle_id).await else {
            debug!("Stop requested for untracked bundle: {}", bundle_id);
            return Ok(());
        };
        let _transition = instance.lock_transition().await;
        self.stop_locked(&instance).await
    }

    /// Stop then start, with nothing else interleaved for this bundle
    pub async fn restart(&self, bundle_id: &BundleId) -> Result<SandboxHandle> {
        info!("Restarting bot for bundle: {}", bundle_id);
        let instance = self.instance_for(bundle_id).await?;
        let transition = instance.lock_transition().await;
        self.stop_locked(&instance).await?;
        self.start_locked(&instance, transition).await
    }

    pub async fn status(&self, bundle_id: &BundleId) -> Result<BotStatus> {
        let instance = self.instance_for(bundle_id).await?;
        Ok(describe(&instance))
    }

    /// Status of every bundle referenced since the engine started
    pub async fn list(&self) -> Vec<BotStatus> {
        self.registry
            .list()
            .await
            .iter()
            .map(|instance| describe(instance))
            .collect()
    }

    /// Attach to the bundle's log: recent lines first, then every new line
    pub async fn subscribe_logs(&self, bundle_id: &BundleId) -> Result<LogSubscription> {
        let instance = self.instance_for(bundle_id).await?;
        let subscription = LogSubscription::attach(instance.logs());
        debug!(
            "Log subscriber {:?} attached to bundle {} ({} replayed)",
            subscription.id(),
            bundle_id,
            subscription.replay().len()
        );
        Ok(subscription)
    }

    /// Detach a subscriber. Unknown bundles and ids are ignored.
    pub async fn unsubscribe_logs(&self, bundle_id: &BundleId, id: SubscriptionId) -> bool {
        match self.registry.get(bundle_id).await {
            Some(instance) => instance.logs().unsubscribe(id),
            None => false,
        }
    }

    /// Resolve a file path requested for a bundle, refusing anything outside it
    pub fn resolve_safe_path(&self, bundle_id: &BundleId, requested: &str) -> Result<PathBuf> {
        guard::resolve_within(&self.bundle_root(bundle_id), requested)
    }

    /// Stop the bundle if needed, then remove it and its files.
    ///
    /// When the stop fails the directory is left in place and the error is
    /// returned.
    pub async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        info!("Deleting bundle: {}", bundle_id);
        let instance = self.instance_for(bundle_id).await?;
        let _transition = instance.lock_transition().await;
        if instance.is_retired() {
            return Err(EngineError::NotFound(bundle_id.to_string()));
        }

        if let Err(e) = self.stop_locked(&instance).await {
            error!("Not deleting bundle {}: stop failed: {}", bundle_id, e);
            return Err(e);
        }

        instance.retire();
        instance.logs().close();

        let root = self.bundle_root(bundle_id);
        let removal = tokio::fs::remove_dir_all(&root).await;
        self.registry.remove(bundle_id, &instance).await;

        match removal {
            Ok(()) => {
                info!("Deleted bundle {} at {}", bundle_id, root.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                error!("Failed to remove bundle directory {}: {}", root.display(), e);
                Err(e.into())
            }
        }
    }

    /// Stop every live sandbox in parallel and end all log streams
    pub async fn shutdown(&self) {
        let instances = self.registry.list().await;
        info!("Shutting down {} bot instance(s)", instances.len());

        let stops = instances.iter().map(|instance| async move {
            let _transition = instance.lock_transition().await;
            if let Err(e) = self.stop_locked(instance).await {
                warn!(
                    "Failed to stop bundle {} during shutdown: {}",
                    instance.bundle_id(),
                    e
                );
            }
            instance.logs().close();
        });
        join_all(stops).await;
    }

    /// Remove managed containers this process is not tracking.
    ///
    /// Containers left behind by a previous process carry the management
    /// label but have no registry entry here. With `dry_run` they are only
    /// reported. Meant for start-up; containers of bundles that are still
    /// starting are skipped since their run is not tracked yet.
    pub async fn reconcile_orphans(&self, dry_run: bool) -> Result<ReconcileReport> {
        let starting = self.registry.starting_bundles().await;
        let containers = self.provider.list_containers().await?;
        let tracked = self.registry.tracked_containers().await;
        info!("Found {} managed container(s)", containers.len());

        let mut report = ReconcileReport::default();
        for container in containers {
            if tracked.contains(&container.id) {
                continue;
            }

            let bundle_starting = container
                .bundle_id
                .as_deref()
                .is_some_and(|id| starting.iter().any(|s| s.as_str() == id));
            if bundle_starting {
                debug!(
                    "Skipping container {} of a bundle that is starting",
                    container.id
                );
                continue;
            }

            warn!(
                "Found orphaned container: {} (name: {}, bundle: {})",
                container.id,
                container.name,
                container.bundle_id.as_deref().unwrap_or("unknown")
            );
            report.orphaned.push(container.id.clone());

            if dry_run {
                continue;
            }

            if container.running {
                if let Err(e) = self
                    .provider
                    .stop_container(&container.id, self.settings.stop_grace_secs())
                    .await
                {
                    warn!("Failed to stop orphaned container {}: {}", container.id, e);
                }
            }

            match self.provider.remove_container(&container.id, true).await {
                Ok(()) => {
                    info!("Removed orphaned container: {}", container.id);
                    report.removed.push(container.id);
                }
                Err(e) => {
                    let message =
                        format!("Failed to remove orphaned container {}: {}", container.id, e);
                    warn!("{}", message);
                    report.errors.push(message);
                }
            }
        }

        info!(
            "Reconcile complete: {} orphaned, {} removed, {} failed",
            report.orphaned.len(),
            report.removed.len(),
            report.errors.len()
        );
        Ok(report)
    }

    /// Registry entry for a bundle, created on first reference if its
    /// directory exists
    async fn instance_for(&self, bundle_id: &BundleId) -> Result<Arc<BotInstance>> {
        if let Some(instance) = self.registry.get(bundle_id).await {
            if !instance.is_retired() {
                return Ok(instance);
            }
        }

        if !self.bundle_root(bundle_id).is_dir() {
            return Err(EngineError::NotFound(bundle_id.to_string()));
        }

        Ok(self.registry.get_or_create(bundle_id).await)
    }

    async fn start_locked(
        &self,
        instance: &Arc<BotInstance>,
        transition: OwnedMutexGuard<()>,
    ) -> Result<SandboxHandle> {
        let bundle_id = instance.bundle_id();

        if instance.is_retired() {
            return Err(EngineError::NotFound(bundle_id.to_string()));
        }

        let snapshot = instance.snapshot();
        if let (BotState::Running | BotState::Starting, Some(handle)) =
            (snapshot.state, snapshot.handle)
        {
            info!("Bot already running for bundle: {}", bundle_id);
            return Ok(handle);
        }

        let root = self.bundle_root(bundle_id);
        if !root.is_dir() {
            return Err(EngineError::NotFound(bundle_id.to_string()));
        }

        info!("Starting bot for bundle: {}", bundle_id);
        instance.set_state(BotState::Starting);

        // The launch runs to completion and holds the transition lock even if
        // the caller stops waiting, so a created sandbox is always tracked
        let manager = self.clone();
        let launching = instance.clone();
        let launch = tokio::spawn(async move {
            let _transition = transition;
            let bundle_id = launching.bundle_id();
            match manager.launch(&launching, &root).await {
                Ok(handle) => {
                    info!(
                        "Bot started for bundle {} in container {}",
                        bundle_id, handle.container_id
                    );
                    Ok(handle)
                }
                Err(e) => {
                    error!("Failed to start bot for bundle {}: {}", bundle_id, e);
                    launching.set_state(BotState::Stopped);
                    Err(e)
                }
            }
        });

        match launch.await {
            Ok(result) => result,
            Err(e) => {
                error!("Launch task for bundle {} failed: {}", bundle_id, e);
                instance.set_state(BotState::Stopped);
                Err(e.into())
            }
        }
    }

    async fn launch(&self, instance: &Arc<BotInstance>, root: &Path) -> Result<SandboxHandle> {
        let bundle_id = instance.bundle_id();

        let entry = self
            .resolver
            .resolve(root)
            .ok_or_else(|| EngineError::NoEntryPoint {
                bundle_id: bundle_id.to_string(),
                reason: self.resolver.describe_search(),
            })?;
        let command = self.resolver.command(&entry);
        debug!("Resolved command for bundle {}: {:?}", bundle_id, command);

        let host_path = tokio::fs::canonicalize(root).await?;
        let run_id = Uuid::new_v4();
        let config = self.container_config(bundle_id, run_id, &host_path, command);

        let container_id = self.provider.create_container(&config).await?;

        let output = match self.provider.stream_logs(&container_id).await {
            Ok(output) => output,
            Err(e) => {
                if let Err(remove_err) = self.provider.remove_container(&container_id, true).await
                {
                    warn!(
                        "Failed to remove container {} after log attach failure: {}",
                        container_id, remove_err
                    );
                }
                return Err(e.into());
            }
        };

        let handle = SandboxHandle {
            container_id,
            run_id,
            started_at: Utc::now(),
        };
        instance.begin_run(handle.clone());
        instance.logs().append(
            LogSource::System,
            format!("sandbox started: {}", config.command.join(" ")),
        );

        let reader = tokio::spawn(pump_output(instance.logs().clone(), output));
        let reader_abort = reader.abort_handle();
        let watcher = tokio::spawn(watch_exit(
            self.provider.clone(),
            instance.clone(),
            handle.clone(),
            reader,
            self.settings.task_join_timeout(),
        ));
        instance.store_tasks(RunTasks {
            run_id,
            reader: reader_abort,
            watcher,
        });

        Ok(handle)
    }

    async fn stop_locked(&self, instance: &Arc<BotInstance>) -> Result<()> {
        let bundle_id = instance.bundle_id();
        let snapshot = instance.snapshot();

        let Some(handle) = snapshot.handle else {
            // Nothing live; reap the tasks of a run that exited on its own
            self.join_tasks(instance).await;
            instance.set_state(BotState::Stopped);
            return Ok(());
        };

        if !instance.begin_stop(handle.run_id) {
            debug!("Bot for bundle {} already exited", bundle_id);
            self.join_tasks(instance).await;
            return Ok(());
        }
        info!(
            "Stopping bot for bundle {} (container {})",
            bundle_id, handle.container_id
        );

        let stop_result = self
            .provider
            .stop_container(&handle.container_id, self.settings.stop_grace_secs())
            .await;
        if let Err(e) = &stop_result {
            error!(
                "Failed to stop container {} for bundle {}: {}",
                handle.container_id, bundle_id, e
            );
            instance
                .logs()
                .append(LogSource::System, format!("stop failed: {}", e));
        }

        self.join_tasks(instance).await;

        if let Err(e) = self
            .provider
            .remove_container(&handle.container_id, true)
            .await
        {
            warn!("Failed to remove container {}: {}", handle.container_id, e);
        }

        if instance.finish_run(handle.run_id) {
            info!("Bot stopped for bundle: {}", bundle_id);
        }

        stop_result.map_err(EngineError::from)
    }

    /// Wait for the run's tasks, aborting them if they outlive the grace window
    async fn join_tasks(&self, instance: &BotInstance) {
        let Some(tasks) = instance.take_tasks() else {
            return;
        };

        let watcher_abort = tasks.watcher.abort_handle();
        if tokio::time::timeout(self.settings.task_join_timeout(), tasks.watcher)
            .await
            .is_err()
        {
            warn!(
                "Tasks for run {} of bundle {} did not finish in time, aborting",
                tasks.run_id,
                instance.bundle_id()
            );
            watcher_abort.abort();
            tasks.reader.abort();
        }
    }

    fn container_config(
        &self,
        bundle_id: &BundleId,
        run_id: Uuid,
        host_path: &Path,
        command: Vec<String>,
    ) -> ContainerConfig {
        let mut labels = HashMap::new();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());
        labels.insert(BUNDLE_LABEL.to_string(), bundle_id.to_string());
        labels.insert(RUN_LABEL.to_string(), run_id.to_string());

        ContainerConfig {
            image: self.settings.image.clone(),
            name: container_name(bundle_id, run_id),
            command,
            working_dir: CONTAINER_WORKDIR.to_string(),
            mount: VolumeMount {
                host_path: host_path.to_string_lossy().into_owned(),
                container_path: CONTAINER_WORKDIR.to_string(),
                readonly: false,
            },
            limits: ResourceLimits {
                memory_bytes: self.settings.memory_limit_bytes(),
                max_processes: self.settings.max_processes,
            },
            network_disabled: true,
            labels,
        }
    }
}

/// Container name for one run of a bundle
pub fn container_name(bundle_id: &BundleId, run_id: Uuid) -> String {
    let run = run_id.simple().to_string();
    format!("botyard-{}-{}", bundle_id, &run[..8])
}

fn describe(instance: &BotInstance) -> BotStatus {
    let snapshot = instance.snapshot();
    BotStatus {
        bundle_id: instance.bundle_id().clone(),
        state: snapshot.state,
        running: snapshot.state == BotState::Running,
        handle: snapshot.handle,
        log_lines: instance.logs().len(),
    }
}

/// Split container output into lines and append them to the bundle log.
///
/// Each line carries the capture time of the chunk that completed it.
async fn pump_output(logs: Arc<LogBuffer>, mut output: OutputStream) {
    let mut splitters: HashMap<StreamType, (LineSplitter, DateTime<Utc>)> = HashMap::new();

    while let Some(chunk) = output.receiver.recv().await {
        let (splitter, last_seen) = splitters
            .entry(chunk.stream)
            .or_insert_with(|| (LineSplitter::new(), chunk.timestamp));
        *last_seen = chunk.timestamp;
        for line in splitter.push(&chunk.data) {
            logs.append_at(chunk.stream.into(), line, chunk.timestamp);
        }
    }

    for (stream, (mut splitter, last_seen)) in splitters {
        if let Some(line) = splitter.finish() {
            logs.append_at(stream.into(), line, last_seen);
        }
    }
}

/// Wait for the sandbox to end, then record the exit and release the run
async fn watch_exit(
    provider: Arc<dyn Provider>,
    instance: Arc<BotInstance>,
    handle: SandboxHandle,
    reader: JoinHandle<()>,
    drain_timeout: Duration,
) {
    let status = match provider.wait_container(&handle.container_id).await {
        Ok(status) => status,
        Err(e) => {
            warn!("Failed to wait on container {}: {}", handle.container_id, e);
            ExitStatus::unknown(e.to_string())
        }
    };

    // Output still in flight belongs before the exit line
    let reader_abort = reader.abort_handle();
    if tokio::time::timeout(drain_timeout, reader).await.is_err() {
        debug!(
            "Output for container {} did not drain in time",
            handle.container_id
        );
        reader_abort.abort();
    }

    // Release the run before announcing the exit so a start issued on the
    // exit line launches a fresh sandbox
    if instance.finish_run(handle.run_id) {
        info!(
            "Bot for bundle {} exited: {}",
            instance.bundle_id(),
            status.describe()
        );
    }

    instance.logs().append(LogSource::System, status.describe());

    if let Err(e) = provider.remove_container(&handle.container_id, true).await {
        warn!(
            "Failed to remove exited container {}: {}",
            handle.container_id, e
        );
    }
}
