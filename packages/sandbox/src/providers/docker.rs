// ABOUTME: Docker provider implementation for local container-based sandboxes
// ABOUTME: Uses bollard to create, stream, wait on and tear down bundle containers

use super::{
    ContainerConfig, ContainerInfo, ExitStatus, OutputChunk, OutputStream, Provider,
    ProviderError, Result, StreamType, BUNDLE_LABEL, MANAGED_LABEL, RUN_LABEL,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
        WaitContainerOptions,
    },
    errors::Error as BollardError,
    image::CreateImageOptions,
    models::{HostConfig, RestartPolicy, RestartPolicyNameEnum},
    Docker,
};
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct DockerProvider {
    client: Docker,
    /// Timeout for image pull operations (default: 10 minutes)
    pull_timeout: Duration,
}

impl DockerProvider {
    /// Create a new Docker provider with default timeout (10 minutes)
    pub fn new() -> Result<Self> {
        Self::with_pull_timeout(Duration::from_secs(
            botyard_config::DEFAULT_IMAGE_PULL_TIMEOUT_SECS,
        ))
    }

    /// Create a new Docker provider with custom pull timeout
    pub fn with_pull_timeout(timeout: Duration) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self::with_client_and_timeout(client, timeout))
    }

    /// Create with a specific Docker connection and default timeout
    pub fn with_client(client: Docker) -> Self {
        Self::with_client_and_timeout(
            client,
            Duration::from_secs(botyard_config::DEFAULT_IMAGE_PULL_TIMEOUT_SECS),
        )
    }

    /// Create with a specific Docker connection and custom timeout
    pub fn with_client_and_timeout(client: Docker, timeout: Duration) -> Self {
        Self {
            client,
            pull_timeout: timeout,
        }
    }

    /// Convert our config to bollard config
    ///
    /// # Security Features
    /// - Memory ceiling with swap disabled
    /// - Process-count ceiling (pids cgroup)
    /// - No network interfaces
    /// - All capabilities dropped, no privilege escalation
    fn to_bollard_config(&self, config: &ContainerConfig) -> Config<String> {
        let mut labels = config.labels.clone();
        labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

        let bind = format!(
            "{}:{}:{}",
            config.mount.host_path,
            config.mount.container_path,
            if config.mount.readonly { "ro" } else { "rw" }
        );

        let host_config = HostConfig {
            binds: Some(vec![bind]),
            memory: Some(config.limits.memory_bytes),
            // Same value as memory: no swap on top of the ceiling
            memory_swap: Some(config.limits.memory_bytes),
            pids_limit: Some(config.limits.max_processes),
            network_mode: if config.network_disabled {
                Some("none".to_string())
            } else {
                None
            },
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::NO),
                maximum_retry_count: Some(0),
            }),
            cap_drop: Some(vec!["ALL".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            privileged: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(config.image.clone()),
            cmd: Some(config.command.clone()),
            working_dir: Some(config.working_dir.clone()),
            labels: Some(labels),
            network_disabled: Some(config.network_disabled),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        info!("Starting container: {}", container_id);

        self.client
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(ProviderError::ImageError(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!(
            "Pulling image: {} (timeout: {:?})",
            image, self.pull_timeout
        );

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let stream = self.client.create_image(Some(options), None, None);

        // Apply timeout to the entire pull operation
        let result = tokio::time::timeout(self.pull_timeout, async {
            let mut stream = stream;
            let mut last_status = String::new();

            while let Some(result) = stream.next().await {
                match result {
                    Ok(info) => {
                        if let Some(status) = &info.status {
                            if status != &last_status {
                                debug!("Pull status: {}", status);
                                last_status = status.clone();
                            }
                        }
                        if let Some(error) = info.error {
                            return Err(ProviderError::ImageError(format!(
                                "Failed to pull image {}: {}",
                                image, error
                            )));
                        }
                    }
                    Err(e) => {
                        return Err(ProviderError::ImageError(format!(
                            "Failed to pull image {}: {}",
                            image, e
                        )));
                    }
                }
            }

            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {
                info!("Successfully pulled image: {}", image);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ProviderError::ImageError(format!(
                "Timeout pulling image {} after {:?}",
                image, self.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn is_available(&self) -> Result<bool> {
        match self.client.ping().await {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("Docker not available: {}", e);
                Ok(false)
            }
        }
    }

    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        info!("Creating container: {}", config.name);

        if !self.image_exists(&config.image).await? {
            self.pull_image(&config.image).await?;
        }

        let bollard_config = self.to_bollard_config(config);
        let options = CreateContainerOptions {
            name: config.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), bollard_config)
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        for warning in &container.warnings {
            warn!("Docker warning for {}: {}", config.name, warning);
        }
        debug!("Created container: {}", container.id);

        if let Err(e) = self.start_container(&container.id).await {
            error!("Failed to start container {}: {}", container.id, e);
            if let Err(cleanup) = self.remove_container(&container.id, true).await {
                warn!(
                    "Failed to remove container {} after start failure: {}",
                    container.id, cleanup
                );
            }
            return Err(e);
        }

        Ok(container.id)
    }

    async fn stop_container(&self, container_id: &str, timeout_secs: u64) -> Result<()> {
        info!(
            "Stopping container: {} (timeout: {}s)",
            container_id, timeout_secs
        );

        let options = StopContainerOptions {
            t: timeout_secs as i64,
        };

        match self
            .client
            .stop_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            // Already stopped, or already gone
            Err(BollardError::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!("Container {} already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        debug!("Removing container: {} (force: {})", container_id, force);

        let options = RemoveContainerOptions {
            force,
            v: true,
            ..Default::default()
        };

        match self
            .client
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            // 404: already removed, 409: removal already in progress
            Err(BollardError::DockerResponseServerError {
                status_code: 404 | 409,
                ..
            }) => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            Err(e) => Err(ProviderError::ContainerError(e.to_string())),
        }
    }

    async fn stream_logs(&self, container_id: &str) -> Result<OutputStream> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: true,
            since: 0,
            timestamps: false,
            ..Default::default()
        };

        let logs = self.client.logs(container_id, Some(options));
        let container_id = container_id.to_string();

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut stream = Box::pin(logs);
            while let Some(result) = stream.next().await {
                match result {
                    Ok(log) => {
                        let (stream_type, data) = match log {
                            LogOutput::StdOut { message } => (StreamType::Stdout, message.to_vec()),
                            LogOutput::StdErr { message } => (StreamType::Stderr, message.to_vec()),
                            LogOutput::Console { message } => {
                                (StreamType::Stdout, message.to_vec())
                            }
                            _ => continue,
                        };

                        let chunk = OutputChunk {
                            timestamp: chrono::Utc::now(),
                            stream: stream_type,
                            data,
                        };

                        if tx.send(chunk).is_err() {
                            break; // Receiver dropped
                        }
                    }
                    Err(e) => {
                        error!("Error streaming logs for {}: {}", container_id, e);
                        break;
                    }
                }
            }
            debug!("Log stream for container {} closed", container_id);
        });

        Ok(OutputStream { receiver: rx })
    }

    async fn wait_container(&self, container_id: &str) -> Result<ExitStatus> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };

        let mut stream = self.client.wait_container(container_id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(ExitStatus {
                code: Some(response.status_code),
                error: response.error.and_then(|e| e.message),
            }),
            // bollard reports a non-zero exit code as an error
            Some(Err(BollardError::DockerContainerWaitError { error, code })) => Ok(ExitStatus {
                code: Some(code),
                error: if error.is_empty() { None } else { Some(error) },
            }),
            Some(Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            })) => Ok(ExitStatus::unknown("container no longer exists")),
            Some(Err(e)) => Err(ProviderError::ContainerError(e.to_string())),
            None => Ok(ExitStatus::unknown("wait stream closed")),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);

        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::ContainerError(e.to_string()))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let labels = c.labels.unwrap_or_default();
                Some(ContainerInfo {
                    id,
                    name: c
                        .names
                        .unwrap_or_default()
                        .first()
                        .map(|n| n.trim_start_matches('/').to_string())
                        .unwrap_or_default(),
                    bundle_id: labels.get(BUNDLE_LABEL).cloned(),
                    run_id: labels.get(RUN_LABEL).cloned(),
                    running: c.state.as_deref() == Some("running"),
                })
            })
            .collect())
    }
}
