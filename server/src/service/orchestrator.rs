//! Orchestrator: facade over an external compose runtime
//!
//! Without a detected runtime the facade stays constructible and every
//! operation fails with `RuntimeUnavailable`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::container::ContainerInfo;
use crate::domain::types::CommandResult;
use crate::error::{Error, Result};
use crate::infra::compose::{ComposeCli, ComposeRuntime};

/// Orchestrator availability report
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub available: bool,
    pub runtime: Option<&'static str>,
    pub compose_file: PathBuf,
}

pub struct Orchestrator {
    cli: Option<ComposeCli>,
    compose_file: PathBuf,
}

impl Orchestrator {
    /// Detect the compose runtime and bind it to the configured compose file
    pub async fn detect(config: &Config) -> Self {
        match ComposeRuntime::detect().await {
            Some(runtime) => Self::new(Some(ComposeCli::new(
                runtime,
                &config.compose_file,
                config.compose_timeout(),
                config.max_output_bytes,
            ))),
            None => {
                warn!("No compose runtime found, orchestrator running in unavailable mode");
                Self::unavailable(&config.compose_file)
            }
        }
    }

    pub fn new(cli: Option<ComposeCli>) -> Self {
        let compose_file = cli
            .as_ref()
            .map(|c| c.compose_file().to_path_buf())
            .unwrap_or_default();
        Self { cli, compose_file }
    }

    /// Facade whose operations all report the runtime as unavailable
    pub fn unavailable(compose_file: &Path) -> Self {
        Self {
            cli: None,
            compose_file: compose_file.to_path_buf(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.cli.is_some()
    }

    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            available: self.is_available(),
            runtime: self.cli.as_ref().map(|c| c.runtime().as_str()),
            compose_file: self.compose_file.clone(),
        }
    }

    fn cli(&self) -> Result<&ComposeCli> {
        self.cli
            .as_ref()
            .ok_or_else(|| Error::RuntimeUnavailable("no compose runtime found".to_string()))
    }

    async fn compose(&self, action: &str, args: Vec<String>) -> Result<CommandResult> {
        let cli = self.cli()?;
        let result = cli.run(&args).await?;
        if result.success {
            info!(action, runtime = cli.runtime().as_str(), "Compose command succeeded");
        } else {
            error!(
                action,
                runtime = cli.runtime().as_str(),
                exit_code = result.exit_code,
                "Compose command failed: {}",
                result.error_text()
            );
        }
        Ok(result)
    }

    /// Start services (all when `services` is empty)
    pub async fn up(&self, services: &[String], detach: bool, profiles: &[String]) -> Result<CommandResult> {
        let mut args = vec!["up".to_string()];
        if detach {
            args.push("-d".to_string());
        }
        for profile in profiles {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args.extend(services.iter().cloned());
        info!(services = ?services, "Starting compose services");
        self.compose("up", args).await
    }

    /// Stop and remove the stack
    pub async fn down(&self, remove_volumes: bool) -> Result<CommandResult> {
        let mut args = vec!["down".to_string()];
        if remove_volumes {
            args.push("-v".to_string());
        }
        info!("Stopping compose stack");
        self.compose("down", args).await
    }

    pub async fn restart(&self, services: &[String]) -> Result<CommandResult> {
        let mut args = vec!["restart".to_string()];
        args.extend(services.iter().cloned());
        info!(services = ?services, "Restarting compose services");
        self.compose("restart", args).await
    }

    /// Stop services without removing them
    pub async fn stop(&self, services: &[String]) -> Result<CommandResult> {
        let mut args = vec!["stop".to_string()];
        args.extend(services.iter().cloned());
        info!(services = ?services, "Stopping compose services");
        self.compose("stop", args).await
    }

    /// Service logs. With `follow` the call streams until the compose timeout
    /// and returns what was collected.
    pub async fn logs(&self, service: Option<&str>, tail: usize, follow: bool) -> Result<CommandResult> {
        let mut args = vec!["logs".to_string(), "--tail".to_string(), tail.to_string()];
        if follow {
            args.push("-f".to_string());
        }
        if let Some(service) = service {
            args.push(service.to_string());
        }
        self.compose("logs", args).await
    }

    /// Containers of the stack. JSON output is preferred; legacy text output
    /// is parsed best-effort.
    pub async fn ps(&self) -> Result<Vec<ContainerInfo>> {
        let json = self
            .compose(
                "ps",
                vec!["ps".to_string(), "--format".to_string(), "json".to_string()],
            )
            .await?;
        if json.success {
            return Ok(parse_ps(&json.stdout));
        }

        // older runtimes reject --format
        let plain = self.compose("ps", vec!["ps".to_string()]).await?;
        if !plain.success {
            return Err(Error::ProcessExecutionFailed(plain.error_text()));
        }
        Ok(parse_ps(&plain.stdout))
    }

    pub async fn pull(&self, services: &[String]) -> Result<CommandResult> {
        let mut args = vec!["pull".to_string()];
        args.extend(services.iter().cloned());
        info!(services = ?services, "Pulling images");
        self.compose("pull", args).await
    }

    pub async fn build(&self, services: &[String], no_cache: bool) -> Result<CommandResult> {
        let mut args = vec!["build".to_string()];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        args.extend(services.iter().cloned());
        info!(services = ?services, "Building images");
        self.compose("build", args).await
    }

    /// Run a shell command inside a running service container
    pub async fn exec(&self, service: &str, command: &str) -> Result<CommandResult> {
        let args = vec![
            "exec".to_string(),
            "-T".to_string(),
            service.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.compose("exec", args).await
    }

    /// Container name -> healthy | running | unhealthy
    pub async fn health(&self) -> Result<BTreeMap<String, String>> {
        Ok(self
            .ps()
            .await?
            .into_iter()
            .map(|c| {
                let health = c.health().to_string();
                (c.name, health)
            })
            .collect())
    }
}

/// Parse `ps` output: a JSON array, JSON lines, or legacy columns
pub fn parse_ps(stdout: &str) -> Vec<ContainerInfo> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    if trimmed.starts_with('[') {
        if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(trimmed) {
            return items.iter().filter_map(container_from_json).collect();
        }
    }

    if trimmed.starts_with('{') {
        let parsed: Vec<ContainerInfo> = trimmed
            .lines()
            .filter(|l| l.trim_start().starts_with('{'))
            .filter_map(|l| serde_json::from_str::<Value>(l).ok())
            .filter_map(|v| container_from_json(&v))
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }

    parse_legacy_ps(trimmed)
}

fn container_from_json(value: &Value) -> Option<ContainerInfo> {
    let obj = value.as_object()?;
    let field = |keys: &[&str]| -> String {
        keys.iter()
            .find_map(|k| obj.get(*k))
            .map(stringify)
            .unwrap_or_default()
    };

    let name = field(&["Name", "Names", "name"]);
    if name.is_empty() {
        return None;
    }

    let mut status = field(&["Status", "status"]);
    if status.is_empty() {
        status = field(&["State", "state"]);
    }
    let health = field(&["Health", "health"]);
    if !health.is_empty() && !status.to_lowercase().contains(&health.to_lowercase()) {
        status = format!("{} ({})", status, health);
    }

    let id: String = field(&["ID", "Id", "id"]).chars().take(12).collect();
    let service = field(&["Service", "service"]);
    let ports = field(&["Ports", "Publishers", "ports"]);

    Some(ContainerInfo {
        id,
        name,
        image: field(&["Image", "image"]),
        status,
        ports,
        service: if service.is_empty() { None } else { Some(service) },
    })
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(stringify).collect::<Vec<_>>().join(", "),
        Value::Object(map) => {
            // podman/compose port objects
            let host = map.get("host_port").or_else(|| map.get("PublishedPort"));
            let target = map.get("container_port").or_else(|| map.get("TargetPort"));
            match (host, target) {
                (Some(h), Some(t)) => format!("{}->{}", stringify(h), stringify(t)),
                _ => value.to_string(),
            }
        }
        other => other.to_string(),
    }
}

/// Columns separated by runs of two or more spaces:
/// `NAME  IMAGE  COMMAND  SERVICE  CREATED  STATUS  PORTS` or the older
/// `Name  Command  State  Ports`.
fn parse_legacy_ps(text: &str) -> Vec<ContainerInfo> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let headers: Vec<String> = split_columns(header)
        .into_iter()
        .map(|h| h.to_lowercase())
        .collect();
    let col = |row: &[String], names: &[&str]| -> String {
        names
            .iter()
            .find_map(|n| headers.iter().position(|h| h == n))
            .and_then(|i| row.get(i).cloned())
            .unwrap_or_default()
    };

    lines
        .filter(|l| !l.trim_start().starts_with('-'))
        .filter_map(|line| {
            let row = split_columns(line);
            let name = row.first()?.clone();
            let service = col(&row, &["service"]);
            Some(ContainerInfo {
                id: col(&row, &["container id", "id"]),
                image: col(&row, &["image"]),
                status: {
                    let s = col(&row, &["status", "state"]);
                    if s.is_empty() {
                        row.get(1..).map(|r| r.join(" ")).unwrap_or_default()
                    } else {
                        s
                    }
                },
                ports: col(&row, &["ports"]),
                service: if service.is_empty() { None } else { Some(service) },
                name,
            })
        })
        .collect()
}

fn split_columns(line: &str) -> Vec<String> {
    line.split("  ")
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
