// ABOUTME: Provider trait and implementations for sandbox execution backends
// ABOUTME: Defines the container capability the lifecycle manager drives for each bundle run

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod docker;

pub use docker::DockerProvider;

/// Label marking a container as created by this engine
pub const MANAGED_LABEL: &str = "botyard.managed";
/// Label carrying the bundle identifier a container runs
pub const BUNDLE_LABEL: &str = "botyard.bundle_id";
/// Label carrying the run identifier of a container
pub const RUN_LABEL: &str = "botyard.run_id";

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Container configuration for creating sandboxes
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    pub command: Vec<String>,
    pub working_dir: String,
    pub mount: VolumeMount,
    pub limits: ResourceLimits,
    /// When true the container gets no network interfaces besides loopback
    pub network_disabled: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    pub host_path: String,
    pub container_path: String,
    pub readonly: bool,
}

/// Hard resource ceilings applied to every sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub max_processes: i64,
}

/// Summary of a container managed by this engine
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub bundle_id: Option<String>,
    pub run_id: Option<String>,
    pub running: bool,
}

/// Terminal result of a sandbox, resolved once when it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: Option<i64>,
    pub error: Option<String>,
}

impl ExitStatus {
    pub fn with_code(code: i64) -> Self {
        Self {
            code: Some(code),
            error: None,
        }
    }

    pub fn unknown(reason: impl Into<String>) -> Self {
        Self {
            code: None,
            error: Some(reason.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human readable description used for the "exited" log line
    pub fn describe(&self) -> String {
        match (self.code, &self.error) {
            (Some(code), None) => format!("sandbox exited with code {}", code),
            (Some(code), Some(err)) => format!("sandbox exited with code {} ({})", code, err),
            (None, Some(err)) => format!("sandbox exited ({})", err),
            (None, None) => "sandbox exited".to_string(),
        }
    }
}

/// Stream output from container logs
pub struct OutputStream {
    pub receiver: tokio::sync::mpsc::UnboundedReceiver<OutputChunk>,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Provider trait for sandbox container backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Check if the provider is available and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Create and start a new container.
    ///
    /// A container that was created but failed to start must be removed
    /// before the error is returned.
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Stop a running container, force-killing it once `timeout_secs` elapse
    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()>;

    /// Remove a container. Removing an unknown container is not an error.
    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()>;

    /// Follow the merged stdout/stderr of a container from its start.
    /// The stream ends when the container exits.
    async fn stream_logs(&self, container_id: &str) -> Result<OutputStream>;

    /// Wait until the container is no longer running
    async fn wait_container(&self, container_id: &str) -> Result<ExitStatus>;

    /// List all containers managed by this engine, including stopped ones
    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;
}
