//! Sandbox service

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::domain::execution::{ExecutionResult, FailureClass};
use crate::domain::sandbox::{IsolationKind, Sandbox, SandboxConfig, SandboxRun, SandboxState};
use crate::error::{Error, Result};
use crate::infra::docker::{ContainerRuntime, CreateContainerOpts};
use crate::infra::process::{EnvPolicy, ProcessOutput, ProcessSpec, ResourceLimits};
use crate::service::executor::{classify, ExecutionEngine};

/// Label key for identifying sandbox containers
const SANDBOX_LABEL_KEY: &str = "appvisor.sandbox.id";

/// Max processes inside a sandbox container
const SANDBOX_PIDS_LIMIT: i64 = 256;

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Sandbox service for managing sandbox lifecycle
pub struct SandboxService {
    sandboxes: DashMap<String, Sandbox>,
    /// Container runtime, if one was detected at startup
    runtime: Option<Arc<dyn ContainerRuntime>>,
    engine: Arc<ExecutionEngine>,
    image: String,
}

/// Isolation chosen for one run
enum Plan {
    Container(Arc<dyn ContainerRuntime>),
    Process { degraded: bool },
}

impl SandboxService {
    /// Create a new sandbox service
    pub fn new(
        runtime: Option<Arc<dyn ContainerRuntime>>,
        engine: Arc<ExecutionEngine>,
        config: &Config,
    ) -> Self {
        if runtime.is_none() {
            warn!("No container runtime: sandboxes requesting container isolation will be refused unless they allow process fallback");
        }
        Self {
            sandboxes: DashMap::new(),
            runtime,
            engine,
            image: config.sandbox_image.clone(),
        }
    }

    /// Register a sandbox. Nothing is started.
    pub fn create(&self, app_id: &str, config: SandboxConfig) -> Result<Sandbox> {
        config.validate()?;

        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{}-{}", app_id, &suffix[..8]);
        let sandbox = Sandbox::new(id.clone(), app_id.to_string(), config);

        info!(
            sandbox = %id,
            app = %app_id,
            isolation = ?sandbox.config.isolation,
            memory = %sandbox.config.memory_limit,
            network = sandbox.config.network,
            "Sandbox created"
        );
        self.sandboxes.insert(id, sandbox.clone());
        Ok(sandbox)
    }

    /// Get a sandbox by ID
    pub fn get(&self, id: &str) -> Result<Sandbox> {
        self.sandboxes
            .get(id)
            .map(|s| s.clone())
            .ok_or_else(|| Error::SandboxNotFound(id.to_string()))
    }

    /// List all sandboxes
    pub fn list(&self) -> Vec<Sandbox> {
        let mut all: Vec<Sandbox> = self.sandboxes.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Run `command` (a shell command line) inside the sandbox
    pub async fn run(
        &self,
        sandbox_id: &str,
        command: &str,
        working_dir: Option<&Path>,
        env: HashMap<String, String>,
    ) -> Result<SandboxRun> {
        let config = {
            let mut sandbox = self
                .sandboxes
                .get_mut(sandbox_id)
                .ok_or_else(|| Error::SandboxNotFound(sandbox_id.to_string()))?;
            if !sandbox.is_ready() {
                return Err(Error::InvalidSandboxState {
                    expected: "idle or stopped".to_string(),
                    actual: sandbox.state.as_str().to_string(),
                });
            }
            sandbox.transition_to(SandboxState::Creating);
            sandbox.config.clone()
        };

        let plan = match (config.isolation, &self.runtime) {
            (IsolationKind::Container, Some(runtime)) => Plan::Container(runtime.clone()),
            (IsolationKind::Container, None) if config.allow_process_fallback => {
                warn!(sandbox = %sandbox_id, "Container runtime unavailable, falling back to process isolation");
                Plan::Process { degraded: true }
            }
            (IsolationKind::Container, None) => {
                let err = Error::IsolationUnavailable(
                    "container isolation requested but no container runtime is available".to_string(),
                );
                self.finish_with_error(sandbox_id, &err.to_string());
                return Err(err);
            }
            (IsolationKind::Process, _) => Plan::Process { degraded: false },
        };

        let mut merged_env = config.environment.clone();
        merged_env.extend(env);

        let run = match plan {
            Plan::Container(runtime) => {
                let result = self
                    .run_in_container(runtime, sandbox_id, &config, command, working_dir, merged_env)
                    .await;
                SandboxRun {
                    sandbox_id: sandbox_id.to_string(),
                    isolation: IsolationKind::Container,
                    degraded: false,
                    warnings: Vec::new(),
                    result,
                }
            }
            Plan::Process { degraded } => {
                let mut warnings = process_warnings(&config);
                if degraded {
                    warnings.insert(
                        0,
                        "container runtime unavailable: ran under process isolation".to_string(),
                    );
                }
                let result = self
                    .run_as_process(sandbox_id, &config, command, working_dir, merged_env)
                    .await;
                SandboxRun {
                    sandbox_id: sandbox_id.to_string(),
                    isolation: IsolationKind::Process,
                    degraded,
                    warnings,
                    result,
                }
            }
        };

        self.finish(sandbox_id, &run.result);
        info!(
            sandbox = %sandbox_id,
            isolation = ?run.isolation,
            degraded = run.degraded,
            success = run.result.success,
            timed_out = run.result.timed_out,
            duration_ms = run.result.duration_ms,
            "Sandbox run finished"
        );
        Ok(run)
    }

    async fn run_as_process(
        &self,
        sandbox_id: &str,
        config: &SandboxConfig,
        command: &str,
        working_dir: Option<&Path>,
        env: HashMap<String, String>,
    ) -> ExecutionResult {
        let started = Instant::now();

        let scratch = match tempfile::Builder::new()
            .prefix("appvisor-sandbox-")
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                return ExecutionResult::infra_failure(
                    format!("failed to create scratch directory: {}", e),
                    started.elapsed().as_millis() as u64,
                );
            }
        };

        let limits = ResourceLimits {
            memory_bytes: config.memory_bytes().ok(),
            cpu_seconds: Some(config.timeout),
            max_file_bytes: config.scratch_bytes().ok(),
            isolate_network: !config.network,
        };

        let mut spec_env = HashMap::new();
        spec_env.insert(
            "PATH".to_string(),
            std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
        );
        spec_env.insert("HOME".to_string(), scratch.path().display().to_string());
        spec_env.insert("TMPDIR".to_string(), scratch.path().display().to_string());
        spec_env.extend(env);

        let spec = ProcessSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            cwd: Some(
                working_dir
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|| scratch.path().to_path_buf()),
            ),
            env: spec_env,
            env_policy: EnvPolicy::Scoped,
            timeout: Duration::from_secs(self.timeout_of(config)),
            max_output_bytes: self.engine.max_output_bytes(),
            limits: Some(limits),
        };

        self.mark_running(sandbox_id, None);
        let mut result = self.engine.run_spec(&spec).await;
        if result.failure == Some(FailureClass::Infra) && !config.network {
            // setrlimit/unshare failures surface as spawn errors
            result.error = result
                .error
                .map(|e| format!("sandbox could not be set up (network isolation required): {}", e));
        }
        result
    }

    async fn run_in_container(
        &self,
        runtime: Arc<dyn ContainerRuntime>,
        sandbox_id: &str,
        config: &SandboxConfig,
        command: &str,
        working_dir: Option<&Path>,
        env: HashMap<String, String>,
    ) -> ExecutionResult {
        let started = Instant::now();
        let elapsed_ms = || started.elapsed().as_millis() as u64;

        let memory = match config.memory_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return ExecutionResult::infra_failure(e.to_string(), elapsed_ms()),
        };
        let scratch = match config.scratch_bytes() {
            Ok(bytes) => bytes,
            Err(e) => return ExecutionResult::infra_failure(e.to_string(), elapsed_ms()),
        };

        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL_KEY.to_string(), sandbox_id.to_string());

        let mut tmpfs = HashMap::new();
        tmpfs.insert("/tmp".to_string(), format!("rw,size={},mode=1777", scratch));

        let run_suffix = Uuid::new_v4().simple().to_string();
        let opts = CreateContainerOpts {
            name: format!("appvisor-sandbox-{}-{}", sandbox_id, &run_suffix[..6]),
            image: self.image.clone(),
            env,
            binds: config
                .allowed_paths
                .iter()
                .map(|p| format!("{}:{}:ro", p, p))
                .collect(),
            working_dir: Some(
                working_dir
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "/tmp".to_string()),
            ),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            labels,
            network_mode: Some(if config.network { "bridge" } else { "none" }.to_string()),
            memory_limit: Some(memory as i64),
            nano_cpus: Some((config.cpu_limit * 1_000_000_000.0) as i64),
            readonly_rootfs: config.read_only,
            tmpfs,
            pids_limit: Some(SANDBOX_PIDS_LIMIT),
            ports: Vec::new(),
        };

        let container_id = match runtime.create_container(opts).await {
            Ok(id) => id,
            Err(e) => {
                error!(sandbox = %sandbox_id, "Failed to create sandbox container: {}", e);
                return ExecutionResult::infra_failure(e.to_string(), elapsed_ms());
            }
        };
        self.mark_running(sandbox_id, Some(container_id.clone()));

        if let Err(e) = runtime.start_container(&container_id).await {
            error!(sandbox = %sandbox_id, "Failed to start sandbox container: {}", e);
            self.remove_quietly(&runtime, &container_id).await;
            return ExecutionResult::infra_failure(e.to_string(), elapsed_ms());
        }

        let timeout = Duration::from_secs(self.timeout_of(config));
        let (exit_code, timed_out) =
            match tokio::time::timeout(timeout, runtime.wait_container(&container_id)).await {
                Ok(Ok(code)) => (Some(code as i32), false),
                Ok(Err(e)) => {
                    warn!(sandbox = %sandbox_id, "Waiting for sandbox container failed: {}", e);
                    (None, false)
                }
                Err(_) => {
                    warn!(sandbox = %sandbox_id, "Sandbox run timed out, killing container");
                    if let Err(e) = runtime.stop_container(&container_id, 0).await {
                        warn!(sandbox = %sandbox_id, "Failed to kill container: {}", e);
                    }
                    (None, true)
                }
            };

        let logs = match runtime
            .container_logs(&container_id, self.engine.max_output_bytes())
            .await
        {
            Ok(logs) => logs,
            Err(e) => {
                warn!(sandbox = %sandbox_id, "Failed to collect sandbox output: {}", e);
                Default::default()
            }
        };

        self.remove_quietly(&runtime, &container_id).await;
        if let Some(mut sandbox) = self.sandboxes.get_mut(sandbox_id) {
            sandbox.container_id = None;
        }

        let output = ProcessOutput {
            exit_code,
            stdout: logs.stdout,
            stderr: logs.stderr,
            timed_out,
            truncated: logs.truncated,
            duration: started.elapsed(),
        };
        if exit_code.is_none() && !timed_out {
            let mut result = classify(output, timeout);
            result.failure = Some(FailureClass::Infra);
            result.error = Some("sandbox container ended without an exit status".to_string());
            return result;
        }
        classify(output, timeout)
    }

    /// Remove bookkeeping and force-remove any backing container. Safe to call
    /// repeatedly.
    pub async fn destroy(&self, sandbox_id: &str) -> Result<()> {
        let Some((_, sandbox)) = self.sandboxes.remove(sandbox_id) else {
            debug!(sandbox = %sandbox_id, "Destroy on unknown sandbox, nothing to do");
            return Ok(());
        };

        if let (Some(container_id), Some(runtime)) = (&sandbox.container_id, &self.runtime) {
            runtime.remove_container(container_id).await?;
        }

        info!(sandbox = %sandbox_id, "Sandbox destroyed");
        Ok(())
    }

    fn timeout_of(&self, config: &SandboxConfig) -> u64 {
        config.timeout.max(1)
    }

    fn mark_running(&self, sandbox_id: &str, container_id: Option<String>) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(sandbox_id) {
            sandbox.container_id = container_id;
            sandbox.transition_to(SandboxState::Running);
        }
    }

    fn finish(&self, sandbox_id: &str, result: &ExecutionResult) {
        let Some(mut sandbox) = self.sandboxes.get_mut(sandbox_id) else {
            // destroyed while running
            return;
        };
        sandbox.record(result);
        if sandbox.state == SandboxState::Creating {
            // never got as far as running
            sandbox.transition_to(SandboxState::Error);
            return;
        }
        let next = if result.success {
            SandboxState::Stopped
        } else {
            SandboxState::Error
        };
        sandbox.transition_to(next);
    }

    fn finish_with_error(&self, sandbox_id: &str, message: &str) {
        if let Some(mut sandbox) = self.sandboxes.get_mut(sandbox_id) {
            sandbox.last_error = message.to_string();
            sandbox.transition_to(SandboxState::Error);
        }
    }

    async fn remove_quietly(&self, runtime: &Arc<dyn ContainerRuntime>, container_id: &str) {
        if let Err(e) = runtime.remove_container(container_id).await {
            error!(container = %container_id, "Failed to remove sandbox container: {}", e);
        }
    }
}

/// Envelope parts process isolation cannot enforce
fn process_warnings(config: &SandboxConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if config.read_only {
        warnings.push(
            "read-only filesystem is not enforced under process isolation".to_string(),
        );
    }
    if !config.allowed_paths.is_empty() {
        warnings.push(
            "allowed_paths are not mounted under process isolation; host visibility follows file permissions"
                .to_string(),
        );
    }
    warnings.push(
        "memory and CPU limits are per-process rlimits, not cgroup ceilings".to_string(),
    );
    warnings
}
