//! Docker management layer

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, WaitContainerOptions,
    },
    image::CreateImageOptions,
    models::{HealthStatusEnum, HostConfig, PortBinding},
    Docker,
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::domain::service::HealthStatus;
use crate::error::{Error, Result};

/// Label key identifying containers owned by this supervisor
pub const OWNER_LABEL_KEY: &str = "appvisor.owner";

/// Container creation options
#[derive(Debug, Clone, Default)]
pub struct CreateContainerOpts {
    /// Container name
    pub name: String,
    /// Image to use
    pub image: String,
    /// Environment variables
    pub env: HashMap<String, String>,
    /// Bind specs (`host:container[:mode]`)
    pub binds: Vec<String>,
    /// Working directory
    pub working_dir: Option<String>,
    /// Command to run
    pub cmd: Option<Vec<String>>,
    /// Labels
    pub labels: HashMap<String, String>,
    /// Network mode
    pub network_mode: Option<String>,
    /// Memory limit in bytes
    pub memory_limit: Option<i64>,
    /// CPU limit in units of 1e-9 CPUs
    pub nano_cpus: Option<i64>,
    /// Mount the root filesystem read-only
    pub readonly_rootfs: bool,
    /// tmpfs mounts (container path -> mount options)
    pub tmpfs: HashMap<String, String>,
    /// Max number of processes
    pub pids_limit: Option<i64>,
    /// TCP ports published 1:1 on the host
    pub ports: Vec<u16>,
}

/// Captured container output
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs {
    pub stdout: String,
    pub stderr: String,
    pub truncated: bool,
}

/// Container operations used by the sandbox and service managers
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the daemon is reachable
    async fn ping(&self) -> Result<()>;

    /// Create a container, pulling its image if needed. Returns the id.
    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Block until the container exits and return its exit code
    async fn wait_container(&self, id: &str) -> Result<i64>;

    /// Collect stdout/stderr, keeping at most `max_bytes` per stream
    async fn container_logs(&self, id: &str, max_bytes: usize) -> Result<CapturedLogs>;

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()>;

    /// Force-remove a container. Removing a missing container succeeds.
    async fn remove_container(&self, id: &str) -> Result<()>;

    /// Runtime-reported health of a container
    async fn container_health(&self, id: &str) -> Result<HealthStatus>;
}

/// Docker manager for container operations
pub struct DockerManager {
    client: Docker,
    default_image: String,
}

impl DockerManager {
    /// Create a new Docker manager
    pub fn new(socket_path: Option<&str>, default_image: &str) -> Result<Self> {
        let client = match socket_path {
            Some(path) => Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| Error::DockerError(e.to_string()))?,
            None => Docker::connect_with_local_defaults()
                .map_err(|e| Error::DockerError(e.to_string()))?,
        };

        Ok(Self {
            client,
            default_image: default_image.to_string(),
        })
    }

    /// Pull an image if not present
    pub async fn ensure_image(&self, image: &str) -> Result<()> {
        let image_name = if image.contains(':') {
            image.to_string()
        } else {
            format!("{}:latest", image)
        };

        // Check if image exists
        match self.client.inspect_image(&image_name).await {
            Ok(_) => {
                debug!("Image {} already exists", image_name);
                return Ok(());
            }
            Err(_) => {
                info!("Pulling image {}...", image_name);
            }
        }

        let options = CreateImageOptions {
            from_image: image_name.clone(),
            ..Default::default()
        };

        let mut stream = self.client.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(Error::DockerError(format!("Failed to pull image: {}", e)));
                }
            }
        }

        info!("Image {} pulled successfully", image_name);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map_err(|e| Error::RuntimeUnavailable(format!("Docker ping failed: {}", e)))?;
        Ok(())
    }

    async fn create_container(&self, opts: CreateContainerOpts) -> Result<String> {
        let image = if opts.image.is_empty() {
            self.default_image.clone()
        } else {
            opts.image
        };

        // Ensure image exists
        self.ensure_image(&image).await?;

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels = opts.labels;
        labels.insert(OWNER_LABEL_KEY.to_string(), "appvisor".to_string());

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for port in &opts.ports {
            let key = format!("{}/tcp", port);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(port.to_string()),
                }]),
            );
        }

        let host_config = HostConfig {
            binds: if opts.binds.is_empty() {
                None
            } else {
                Some(opts.binds)
            },
            network_mode: opts.network_mode,
            memory: opts.memory_limit,
            nano_cpus: opts.nano_cpus,
            readonly_rootfs: Some(opts.readonly_rootfs),
            tmpfs: if opts.tmpfs.is_empty() {
                None
            } else {
                Some(opts.tmpfs)
            },
            pids_limit: opts.pids_limit,
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            ..Default::default()
        };

        let config = Config {
            image: Some(image),
            env: if env.is_empty() { None } else { Some(env) },
            working_dir: opts.working_dir,
            cmd: opts.cmd,
            labels: Some(labels),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: opts.name.clone(),
            platform: None,
        };

        let response = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to create container: {}", e)))?;

        info!("Container {} created with ID: {}", opts.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.client
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| Error::DockerError(format!("Failed to start container: {}", e)))?;

        info!("Container {} started", id);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.client.wait_container(id, Some(options));

        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as an error carrying the code
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(Error::DockerError(format!(
                "Failed to wait for container: {}",
                e
            ))),
            None => Err(Error::DockerError(
                "Container wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn container_logs(&self, id: &str, max_bytes: usize) -> Result<CapturedLogs> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            tail: "all".to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(id, Some(options));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut truncated = false;

        while let Some(result) = stream.next().await {
            let output = result.map_err(|e| Error::DockerError(e.to_string()))?;
            let (target, message) = match output {
                LogOutput::StdOut { message } => (&mut stdout, message),
                LogOutput::StdErr { message } => (&mut stderr, message),
                _ => continue,
            };
            let room = max_bytes.saturating_sub(target.len());
            if message.len() > room {
                truncated = true;
            }
            target.extend_from_slice(&message[..message.len().min(room)]);
        }

        Ok(CapturedLogs {
            stdout: String::from_utf8_lossy(&stdout).to_string(),
            stderr: String::from_utf8_lossy(&stderr).to_string(),
            truncated,
        })
    }

    async fn stop_container(&self, id: &str, timeout_secs: i64) -> Result<()> {
        let options = StopContainerOptions { t: timeout_secs };

        match self.client.stop_container(id, Some(options)).await {
            Ok(()) => {}
            // 304: already stopped, 404: already gone
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => {
                debug!("Container {} already stopped", id);
            }
            Err(e) => {
                return Err(Error::DockerError(format!(
                    "Failed to stop container: {}",
                    e
                )))
            }
        }

        info!("Container {} stopped", id);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true, // Remove associated volumes
            ..Default::default()
        };

        match self.client.remove_container(id, Some(options)).await {
            Ok(()) => {
                info!("Container {} removed", id);
                Ok(())
            }
            // 404: gone, 409: removal already in progress
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404 | 409,
                message,
            }) => {
                debug!("Container {} already removed: {}", id, message);
                Ok(())
            }
            Err(e) => Err(Error::DockerError(format!(
                "Failed to remove container: {}",
                e
            ))),
        }
    }

    async fn container_health(&self, id: &str) -> Result<HealthStatus> {
        let info = self
            .client
            .inspect_container(id, None)
            .await
            .map_err(|e| Error::DockerError(e.to_string()))?;

        let Some(state) = info.state else {
            warn!("Container {} has no state", id);
            return Ok(HealthStatus::Unknown);
        };

        if !state.running.unwrap_or(false) {
            return Ok(HealthStatus::Unhealthy);
        }

        Ok(match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => HealthStatus::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthStatus::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthStatus::Starting,
            // No healthcheck configured in the image
            _ => HealthStatus::Running,
        })
    }
}
