//! Appvisor
//!
//! Single-node supervisor for heterogeneous units of work: app scripts and
//! build targets discovered from a directory of manifests, resource-bounded
//! sandboxed commands, and long-running services with health checks and
//! bounded auto-restart, optionally delegated to a compose runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod service;

pub use config::Config;
pub use error::{Error, ErrorKind, Outcome, Result};

use domain::container::ContainerInfo;
use domain::execution::ExecutionResult;
use domain::sandbox::{SandboxConfig, SandboxRun};
use domain::service::ServiceSummary;
use domain::types::CommandResult;
use infra::docker::ContainerRuntime;
use infra::sqlite::ServiceStateRepository;
use service::executor::ExecutionEngine;
use service::orchestrator::{Orchestrator, OrchestratorStatus};
use service::registry::{AppSummary, ManifestRegistry};
use service::sandbox::SandboxService;
use service::service_manager::ServiceManager;

/// Entry point for collaborators. Every operation returns an [`Outcome`].
pub struct Supervisor {
    config: Arc<Config>,
    registry: Arc<ManifestRegistry>,
    sandboxes: Arc<SandboxService>,
    services: ServiceManager,
    orchestrator: Arc<Orchestrator>,
}

impl Supervisor {
    /// Wire the components, scan apps and register the declared services.
    /// Nothing is started.
    pub async fn build(
        config: Config,
        repository: Option<ServiceStateRepository>,
        containers: Option<Arc<dyn ContainerRuntime>>,
        orchestrator: Orchestrator,
    ) -> Self {
        let config = Arc::new(config);
        let engine = Arc::new(ExecutionEngine::new(config.max_output_bytes));
        let orchestrator = Arc::new(orchestrator);

        let registry = Arc::new(ManifestRegistry::new(&config, engine.clone()));
        let apps = registry.scan();
        info!(count = apps.len(), "Apps registered");

        let sandboxes = Arc::new(SandboxService::new(containers.clone(), engine, &config));
        let services = ServiceManager::new(&config, repository, containers, orchestrator.clone());

        if let Some(path) = &config.services_file {
            if let Err(e) = services.load_services(path).await {
                error!(path = %path.display(), "Failed to load services: {}", e);
            }
        }

        Self {
            config,
            registry,
            sandboxes,
            services,
            orchestrator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ManifestRegistry {
        &self.registry
    }

    pub fn sandboxes(&self) -> &SandboxService {
        &self.sandboxes
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    // Apps

    /// App id owning a command phrase
    pub fn resolve(&self, text: &str) -> Outcome<String> {
        self.registry
            .resolve(text)
            .ok_or_else(|| Error::AppNotFound(format!("no app handles \"{}\"", text)))
            .into()
    }

    pub fn apps(&self) -> Outcome<Vec<AppSummary>> {
        Outcome::ok(self.registry.summaries())
    }

    pub async fn run_script(&self, app_id: &str, script: &str, args: &[String]) -> Outcome<ExecutionResult> {
        execution_outcome(self.registry.run_script(app_id, script, args).await)
    }

    pub async fn run_make(
        &self,
        app_id: &str,
        target: &str,
        vars: &[(String, String)],
    ) -> Outcome<ExecutionResult> {
        execution_outcome(self.registry.run_make(app_id, target, vars).await)
    }

    pub async fn read_file(&self, app_id: &str, path: &str) -> Outcome<String> {
        self.registry.read_file(app_id, path).await.into()
    }

    pub async fn write_file(&self, app_id: &str, path: &str, content: &str) -> Outcome<()> {
        self.registry.write_file(app_id, path, content).await.into()
    }

    pub fn reload_app(&self, app_id: &str) -> Outcome<()> {
        self.registry.reload(app_id).into()
    }

    // Services

    pub async fn start_service(&self, id: &str) -> Outcome<ServiceSummary> {
        self.after(id, self.services.start(id).await).await
    }

    pub async fn stop_service(&self, id: &str) -> Outcome<ServiceSummary> {
        self.after(id, self.services.stop(id).await).await
    }

    pub async fn restart_service(&self, id: &str) -> Outcome<ServiceSummary> {
        self.after(id, self.services.restart(id).await).await
    }

    pub async fn service_status(&self, id: &str) -> Outcome<ServiceSummary> {
        self.services.get(id).await.into()
    }

    pub async fn list_services(&self) -> Outcome<Vec<ServiceSummary>> {
        Outcome::ok(self.services.list().await)
    }

    /// Outcome of a lifecycle operation, carrying the resulting summary
    async fn after(&self, id: &str, result: Result<()>) -> Outcome<ServiceSummary> {
        match (result, self.services.get(id).await) {
            (Ok(()), summary) => summary.into(),
            (Err(e), Ok(summary)) => Outcome::failed(&e, summary),
            (Err(e), Err(_)) => Outcome::err(&e),
        }
    }

    // Sandboxes

    /// Create a sandbox, run one command in it and destroy it
    pub async fn sandbox_exec(
        &self,
        app_id: &str,
        config: SandboxConfig,
        command: &str,
        working_dir: Option<PathBuf>,
        env: HashMap<String, String>,
    ) -> Outcome<SandboxRun> {
        let sandbox = match self.sandboxes.create(app_id, config) {
            Ok(sandbox) => sandbox,
            Err(e) => return Outcome::err(&e),
        };

        let run = self
            .sandboxes
            .run(&sandbox.id, command, working_dir.as_deref(), env)
            .await;
        if let Err(e) = self.sandboxes.destroy(&sandbox.id).await {
            warn!(sandbox = %sandbox.id, "Failed to destroy sandbox: {}", e);
        }

        match run {
            Ok(run) => match run.result.to_error() {
                None => Outcome::ok(run),
                Some(err) => Outcome::failed(&err, run),
            },
            Err(e) => Outcome::err(&e),
        }
    }

    // Compose stack

    pub fn compose_status(&self) -> Outcome<OrchestratorStatus> {
        Outcome::ok(self.orchestrator.status())
    }

    pub async fn compose_up(&self, services: &[String]) -> Outcome<CommandResult> {
        self.command_outcome(self.orchestrator.up(services, true, &[]).await)
    }

    pub async fn compose_down(&self, remove_volumes: bool) -> Outcome<CommandResult> {
        self.command_outcome(self.orchestrator.down(remove_volumes).await)
    }

    pub async fn compose_restart(&self, services: &[String]) -> Outcome<CommandResult> {
        self.command_outcome(self.orchestrator.restart(services).await)
    }

    pub async fn compose_logs(&self, service: Option<&str>, tail: usize) -> Outcome<CommandResult> {
        self.command_outcome(self.orchestrator.logs(service, tail, false).await)
    }

    pub async fn compose_ps(&self) -> Outcome<Vec<ContainerInfo>> {
        self.orchestrator.ps().await.into()
    }

    pub async fn compose_exec(&self, service: &str, command: &str) -> Outcome<CommandResult> {
        self.command_outcome(self.orchestrator.exec(service, command).await)
    }

    fn command_outcome(&self, result: Result<CommandResult>) -> Outcome<CommandResult> {
        match result {
            Ok(out) if out.success => Outcome::ok(out),
            Ok(out) => {
                let err = if out.timed_out {
                    Error::ProcessTimeout(self.config.compose_timeout)
                } else {
                    Error::ProcessExecutionFailed(out.error_text())
                };
                Outcome::failed(&err, out)
            }
            Err(e) => Outcome::err(&e),
        }
    }

    /// Stop every service
    pub async fn shutdown(&self) {
        self.services.shutdown().await;
    }
}

fn execution_outcome(result: Result<ExecutionResult>) -> Outcome<ExecutionResult> {
    match result {
        Ok(exec) => match exec.to_error() {
            None => Outcome::ok(exec),
            Some(err) => Outcome::failed(&err, exec),
        },
        Err(e) => Outcome::err(&e),
    }
}
