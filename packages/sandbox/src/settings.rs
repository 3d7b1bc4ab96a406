// ABOUTME: Engine settings for sandbox runs and log buffering
// ABOUTME: Fixed resource ceilings, grace period, runtime image and entry-point conventions

use botyard_config as defaults;
use std::path::PathBuf;
use std::time::Duration;

/// Working directory inside the sandbox where the bundle is mounted
pub const CONTAINER_WORKDIR: &str = "/app";

/// Settings shared by every bundle the engine manages
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Directory holding one subdirectory per bundle
    pub bundles_root: PathBuf,
    /// Container image every sandbox runs
    pub image: String,
    /// Program the resolved entry file is passed to
    pub interpreter: String,
    /// Conventional entry filenames, checked in order
    pub entry_candidates: Vec<String>,
    /// Manifest file consulted when no candidate exists
    pub manifest_file: String,
    /// Manifest field naming the entry file
    pub manifest_entry_field: String,
    pub memory_limit_mb: u64,
    pub max_processes: i64,
    /// Time a stop waits for cooperative termination before the kill
    pub stop_grace: Duration,
    /// Lines retained per bundle
    pub log_capacity: usize,
    /// Lines replayed to a new subscriber
    pub log_replay_lines: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            bundles_root: PathBuf::from(defaults::DEFAULT_BUNDLES_ROOT),
            image: defaults::DEFAULT_SANDBOX_IMAGE.to_string(),
            interpreter: defaults::DEFAULT_SANDBOX_INTERPRETER.to_string(),
            entry_candidates: vec![
                "index.js".to_string(),
                "app.js".to_string(),
                "server.js".to_string(),
            ],
            manifest_file: "package.json".to_string(),
            manifest_entry_field: "main".to_string(),
            memory_limit_mb: defaults::DEFAULT_SANDBOX_MEMORY_MB,
            max_processes: defaults::DEFAULT_SANDBOX_MAX_PROCESSES,
            stop_grace: Duration::from_secs(defaults::DEFAULT_STOP_GRACE_SECS),
            log_capacity: defaults::DEFAULT_LOG_CAPACITY,
            log_replay_lines: defaults::DEFAULT_LOG_REPLAY_LINES,
        }
    }
}

impl EngineSettings {
    /// Default settings rooted at the given bundles directory
    pub fn with_bundles_root(bundles_root: impl Into<PathBuf>) -> Self {
        Self {
            bundles_root: bundles_root.into(),
            ..Self::default()
        }
    }

    pub fn memory_limit_bytes(&self) -> i64 {
        // Saturate rather than wrap on absurd values
        i64::try_from(self.memory_limit_mb.saturating_mul(1024 * 1024)).unwrap_or(i64::MAX)
    }

    /// Grace period in whole seconds, as the container API expects
    pub fn stop_grace_secs(&self) -> u64 {
        self.stop_grace.as_secs().max(1)
    }

    /// Upper bound on how long a stop waits for the run's tasks to wind down
    pub fn task_join_timeout(&self) -> Duration {
        self.stop_grace + Duration::from_secs(2)
    }
}
