//! Compose CLI detection and invocation

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::domain::types::CommandResult;
use crate::error::Result;
use crate::infra::process::{run_process, ProcessSpec};

/// Timeout for the `docker compose version` probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// A detected compose implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComposeRuntime {
    /// Rootless, preferred when present
    PodmanCompose,
    /// Standalone `docker-compose` binary
    DockerCompose,
    /// `docker compose` CLI plugin
    DockerPlugin,
}

impl ComposeRuntime {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComposeRuntime::PodmanCompose => "podman-compose",
            ComposeRuntime::DockerCompose => "docker-compose",
            ComposeRuntime::DockerPlugin => "docker compose",
        }
    }

    /// Program and leading arguments for an invocation
    fn command_prefix(&self) -> (&'static str, Vec<String>) {
        match self {
            ComposeRuntime::PodmanCompose => ("podman-compose", Vec::new()),
            ComposeRuntime::DockerCompose => ("docker-compose", Vec::new()),
            ComposeRuntime::DockerPlugin => ("docker", vec!["compose".to_string()]),
        }
    }

    /// Detect the available runtime: podman-compose, then docker-compose,
    /// then the docker plugin.
    pub async fn detect() -> Option<Self> {
        if which::which("podman-compose").is_ok() {
            return Some(ComposeRuntime::PodmanCompose);
        }
        if which::which("docker-compose").is_ok() {
            return Some(ComposeRuntime::DockerCompose);
        }
        if which::which("docker").is_ok() {
            let probe = ProcessSpec::new(
                "docker",
                vec!["compose".to_string(), "version".to_string()],
                PROBE_TIMEOUT,
            );
            match run_process(&probe).await {
                Ok(out) if out.success() => return Some(ComposeRuntime::DockerPlugin),
                Ok(out) => debug!("docker compose plugin probe failed: {}", out.stderr.trim()),
                Err(e) => debug!("docker compose plugin probe failed: {}", e),
            }
        }
        None
    }
}

/// Bound invocation of one compose runtime against one compose file
#[derive(Debug, Clone)]
pub struct ComposeCli {
    runtime: ComposeRuntime,
    compose_file: PathBuf,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ComposeCli {
    pub fn new(
        runtime: ComposeRuntime,
        compose_file: &Path,
        timeout: Duration,
        max_output_bytes: usize,
    ) -> Self {
        info!(
            runtime = runtime.as_str(),
            compose_file = %compose_file.display(),
            "Compose runtime selected"
        );
        Self {
            runtime,
            compose_file: compose_file.to_path_buf(),
            timeout,
            max_output_bytes,
        }
    }

    pub fn runtime(&self) -> ComposeRuntime {
        self.runtime
    }

    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }

    /// Full argv for a compose subcommand
    pub fn argv(&self, args: &[String]) -> (String, Vec<String>) {
        let (program, mut argv) = self.runtime.command_prefix();
        argv.push("-f".to_string());
        argv.push(self.compose_file.display().to_string());
        argv.extend(args.iter().cloned());
        (program.to_string(), argv)
    }

    /// Run a compose subcommand with the configured timeout
    pub async fn run(&self, args: &[String]) -> Result<CommandResult> {
        self.run_with_timeout(args, self.timeout).await
    }

    pub async fn run_with_timeout(&self, args: &[String], timeout: Duration) -> Result<CommandResult> {
        let (program, argv) = self.argv(args);
        debug!(program = %program, args = ?argv, "Running compose command");

        let mut spec = ProcessSpec::new(program, argv, timeout).max_output_bytes(self.max_output_bytes);
        if let Some(dir) = self.compose_file.parent() {
            if !dir.as_os_str().is_empty() {
                spec = spec.cwd(dir);
            }
        }

        let out = run_process(&spec).await?;
        if out.timed_out {
            warn!(args = ?args, "Compose command timed out");
        }

        Ok(CommandResult {
            success: out.success(),
            exit_code: out.exit_code.unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
            timed_out: out.timed_out,
        })
    }
}
