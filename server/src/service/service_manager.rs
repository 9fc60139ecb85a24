//! Service manager: lifecycle state machine, health loops and bounded
//! auto-restart for long-running units

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::container::ContainerInfo;
use crate::domain::service::{
    HealthStatus, LifecycleEvent, ServiceConfig, ServiceKind, ServiceState, ServiceStatus,
    ServiceSummary,
};
use crate::error::{Error, Result};
use crate::infra::docker::{ContainerRuntime, CreateContainerOpts};
use crate::infra::process::{run_process, ProcessSpec};
use crate::infra::sqlite::ServiceStateRepository;
use crate::service::orchestrator::Orchestrator;

/// Label carrying the owning service id on service containers
const SERVICE_LABEL_KEY: &str = "appvisor.service";

/// Grace period given to a container on stop
const STOP_TIMEOUT_SECS: i64 = 10;

const EVENT_CAPACITY: usize = 64;

/// Lifecycle observer. Errors and panics are logged and ignored.
pub type LifecycleCallback = Arc<dyn Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync>;

/// How a service is actually realized
#[async_trait]
pub trait ServiceDriver: Send + Sync {
    /// Bring the unit up. Returns the backing container id, if any.
    async fn start(&self, config: &ServiceConfig) -> Result<Option<String>>;

    async fn stop(&self, config: &ServiceConfig, container_id: Option<&str>) -> Result<()>;

    async fn health(&self, config: &ServiceConfig, container_id: Option<&str>) -> Result<HealthStatus>;
}

/// In-process component: present while the supervisor runs
struct InternalDriver;

#[async_trait]
impl ServiceDriver for InternalDriver {
    async fn start(&self, _config: &ServiceConfig) -> Result<Option<String>> {
        Ok(None)
    }

    async fn stop(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn health(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<HealthStatus> {
        Ok(HealthStatus::Running)
    }
}

/// Container-backed service on the local Docker daemon
struct ContainerDriver {
    runtime: Arc<dyn ContainerRuntime>,
}

#[async_trait]
impl ServiceDriver for ContainerDriver {
    async fn start(&self, config: &ServiceConfig) -> Result<Option<String>> {
        let ServiceKind::Container(deploy) = &config.kind else {
            return Err(Error::InvalidServiceConfig(format!(
                "service {} is not container-backed",
                config.id
            )));
        };
        let image = deploy
            .image
            .clone()
            .unwrap_or_else(|| format!("appvisor/{}:latest", config.id));

        let name = config.container_name();
        // leftover from a previous supervisor run
        self.runtime.remove_container(&name).await?;

        let mut labels = HashMap::new();
        labels.insert(SERVICE_LABEL_KEY.to_string(), config.id.clone());

        let opts = CreateContainerOpts {
            name,
            image,
            env: deploy.environment.clone(),
            binds: deploy.volumes.clone(),
            labels,
            ports: deploy.ports.clone(),
            ..Default::default()
        };

        let container_id = self.runtime.create_container(opts).await?;
        if let Err(e) = self.runtime.start_container(&container_id).await {
            if let Err(cleanup) = self.runtime.remove_container(&container_id).await {
                warn!(service_id = %config.id, "Failed to remove unstarted container: {}", cleanup);
            }
            return Err(e);
        }
        Ok(Some(container_id))
    }

    async fn stop(&self, config: &ServiceConfig, container_id: Option<&str>) -> Result<()> {
        let target = container_id
            .map(str::to_string)
            .unwrap_or_else(|| config.container_name());
        self.runtime.stop_container(&target, STOP_TIMEOUT_SECS).await?;
        self.runtime.remove_container(&target).await
    }

    async fn health(&self, config: &ServiceConfig, container_id: Option<&str>) -> Result<HealthStatus> {
        let target = container_id
            .map(str::to_string)
            .unwrap_or_else(|| config.container_name());
        self.runtime.container_health(&target).await
    }
}

/// Externally managed unit: only observed, never spawned
struct ExternalDriver {
    probe_timeout: Duration,
}

#[async_trait]
impl ServiceDriver for ExternalDriver {
    async fn start(&self, _config: &ServiceConfig) -> Result<Option<String>> {
        Ok(None)
    }

    async fn stop(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn health(&self, config: &ServiceConfig, _container_id: Option<&str>) -> Result<HealthStatus> {
        let ServiceKind::External {
            health_command: Some(argv),
        } = &config.kind
        else {
            return Ok(HealthStatus::Running);
        };
        let Some((program, args)) = argv.split_first() else {
            return Ok(HealthStatus::Running);
        };

        let out = run_process(&ProcessSpec::new(program, args.to_vec(), self.probe_timeout)).await?;
        if out.success() {
            Ok(HealthStatus::Healthy)
        } else {
            debug!(service_id = %config.id, "Health probe failed: {}", out.stderr.trim());
            Ok(HealthStatus::Unhealthy)
        }
    }
}

/// Service that is one member of the compose stack
struct ComposeDriver {
    orchestrator: Arc<Orchestrator>,
}

impl ComposeDriver {
    fn target(config: &ServiceConfig) -> String {
        match &config.kind {
            ServiceKind::Compose {
                compose_service: Some(name),
            } => name.clone(),
            _ => config.id.clone(),
        }
    }
}

#[async_trait]
impl ServiceDriver for ComposeDriver {
    async fn start(&self, config: &ServiceConfig) -> Result<Option<String>> {
        let result = self.orchestrator.up(&[Self::target(config)], true, &[]).await?;
        if !result.success {
            return Err(Error::ServiceStartFailed(result.error_text()));
        }
        Ok(None)
    }

    async fn stop(&self, config: &ServiceConfig, _container_id: Option<&str>) -> Result<()> {
        let result = self.orchestrator.stop(&[Self::target(config)]).await?;
        if !result.success {
            return Err(Error::ProcessExecutionFailed(result.error_text()));
        }
        Ok(())
    }

    async fn health(&self, config: &ServiceConfig, _container_id: Option<&str>) -> Result<HealthStatus> {
        let containers = self.orchestrator.ps().await?;
        Ok(stack_health(&containers, &Self::target(config)))
    }
}

/// Health of one compose service within a `ps` listing. A service with no
/// container is unhealthy.
fn stack_health(containers: &[ContainerInfo], service: &str) -> HealthStatus {
    containers
        .iter()
        .find(|c| c.belongs_to(service))
        .map(|c| HealthStatus::from_str(c.health()))
        .unwrap_or(HealthStatus::Unhealthy)
}

/// Stand-in for a kind whose runtime is missing on this host
struct UnavailableDriver {
    reason: &'static str,
}

#[async_trait]
impl ServiceDriver for UnavailableDriver {
    async fn start(&self, _config: &ServiceConfig) -> Result<Option<String>> {
        Err(Error::RuntimeUnavailable(self.reason.to_string()))
    }

    async fn stop(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn health(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<HealthStatus> {
        Ok(HealthStatus::Unhealthy)
    }
}

struct ServiceEntry {
    config: ServiceConfig,
    driver: Arc<dyn ServiceDriver>,
    state: Mutex<ServiceState>,
    /// Serializes start/stop/restart/health on this service
    op_lock: Mutex<()>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceEntry {
    async fn summary(&self) -> ServiceSummary {
        let state = self.state.lock().await;
        ServiceSummary {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            kind: self.config.kind.as_str(),
            enabled: self.config.enabled,
            status: state.status,
            health: state.health,
            started_at: state.started_at,
            restart_count: state.restart_count,
            last_error: state.last_error.clone(),
        }
    }

    async fn cancel_health_loop(&self) {
        if let Some(handle) = self.health_task.lock().await.take() {
            handle.abort();
        }
    }
}

struct ManagerInner {
    services: DashMap<String, Arc<ServiceEntry>>,
    order: RwLock<Vec<String>>,
    repository: Option<ServiceStateRepository>,
    containers: Option<Arc<dyn ContainerRuntime>>,
    orchestrator: Arc<Orchestrator>,
    events: broadcast::Sender<LifecycleEvent>,
    callbacks: RwLock<Vec<LifecycleCallback>>,
    restart_settle: Duration,
    probe_timeout: Duration,
}

/// Supervises registered services. Cheap to clone.
#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<ManagerInner>,
}

impl ServiceManager {
    pub fn new(
        config: &Config,
        repository: Option<ServiceStateRepository>,
        containers: Option<Arc<dyn ContainerRuntime>>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                services: DashMap::new(),
                order: RwLock::new(Vec::new()),
                repository,
                containers,
                orchestrator,
                events,
                callbacks: RwLock::new(Vec::new()),
                restart_settle: config.restart_settle(),
                probe_timeout: config.script_timeout(),
            }),
        }
    }

    /// Read service declarations from a TOML/JSON/YAML file and register
    /// them. Returns the registered ids.
    pub async fn load_services(&self, path: &Path) -> Result<Vec<String>> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?;
        let declared: HashMap<String, ServiceConfig> = match settings.get("services") {
            Ok(services) => services,
            Err(config::ConfigError::NotFound(_)) => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        let mut declared: Vec<(String, ServiceConfig)> = declared.into_iter().collect();
        declared.sort_by(|a, b| a.0.cmp(&b.0));

        let mut registered = Vec::new();
        for (key, mut service) in declared {
            if service.id.is_empty() {
                service.id = key;
            }
            if service.name.is_empty() {
                service.name = service.id.clone();
            }
            let id = service.id.clone();
            match self.register(service).await {
                Ok(()) => registered.push(id),
                Err(e) => error!(service_id = %id, "Failed to register service: {}", e),
            }
        }

        info!(count = registered.len(), path = %path.display(), "Services loaded");
        Ok(registered)
    }

    /// Register a service with the driver matching its kind
    pub async fn register(&self, config: ServiceConfig) -> Result<()> {
        let driver = self.driver_for(&config);
        self.register_with_driver(config, driver).await
    }

    /// Register a service realized by a caller-supplied driver
    pub async fn register_with_driver(
        &self,
        config: ServiceConfig,
        driver: Arc<dyn ServiceDriver>,
    ) -> Result<()> {
        if config.id.trim().is_empty() {
            return Err(Error::InvalidServiceConfig("service id is empty".to_string()));
        }
        if self.inner.services.contains_key(&config.id) {
            return Err(Error::InvalidServiceConfig(format!(
                "duplicate service id: {}",
                config.id
            )));
        }

        let mut state = ServiceState::default();
        if let Some(repo) = &self.inner.repository {
            match repo.get(&config.id).await {
                Ok(Some(persisted)) => {
                    state.restart_count = persisted.state.restart_count;
                    state.last_error = persisted.state.last_error;
                    state.last_known_status = Some(persisted.state.status);
                    debug!(
                        service_id = %config.id,
                        last_known_status = persisted.state.status.as_str(),
                        "Restored persisted service state"
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(service_id = %config.id, "Failed to read persisted state: {}", e),
            }
        }

        let id = config.id.clone();
        info!(service_id = %id, kind = config.kind.as_str(), "Service registered");
        self.inner.services.insert(
            id.clone(),
            Arc::new(ServiceEntry {
                config,
                driver,
                state: Mutex::new(state),
                op_lock: Mutex::new(()),
                health_task: Mutex::new(None),
            }),
        );
        self.inner.order.write().await.push(id);
        Ok(())
    }

    fn driver_for(&self, config: &ServiceConfig) -> Arc<dyn ServiceDriver> {
        match &config.kind {
            ServiceKind::Internal => Arc::new(InternalDriver),
            ServiceKind::Container(_) => match &self.inner.containers {
                Some(runtime) => Arc::new(ContainerDriver {
                    runtime: runtime.clone(),
                }),
                None => Arc::new(UnavailableDriver {
                    reason: "no container runtime available",
                }),
            },
            ServiceKind::External { .. } => Arc::new(ExternalDriver {
                probe_timeout: self.inner.probe_timeout,
            }),
            ServiceKind::Compose { .. } => {
                if self.inner.orchestrator.is_available() {
                    Arc::new(ComposeDriver {
                        orchestrator: self.inner.orchestrator.clone(),
                    })
                } else {
                    Arc::new(UnavailableDriver {
                        reason: "no compose runtime found",
                    })
                }
            }
        }
    }

    fn entry(&self, id: &str) -> Result<Arc<ServiceEntry>> {
        self.inner
            .services
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// Receive every lifecycle event
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events.subscribe()
    }

    /// Register a lifecycle callback
    pub async fn on<F>(&self, callback: F)
    where
        F: Fn(&LifecycleEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.callbacks.write().await.push(Arc::new(callback));
    }

    async fn emit(&self, event: LifecycleEvent) {
        // no subscribers is fine
        let _ = self.inner.events.send(event.clone());

        let callbacks = self.inner.callbacks.read().await.clone();
        for callback in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(service_id = event.service_id(), "Lifecycle callback failed: {}", e),
                Err(_) => error!(service_id = event.service_id(), "Lifecycle callback panicked"),
            }
        }
    }

    async fn persist(&self, id: &str, state: &ServiceState) {
        if let Some(repo) = &self.inner.repository {
            if let Err(e) = repo.upsert(id, state).await {
                warn!(service_id = %id, "Failed to persist service state: {}", e);
            }
        }
    }

    /// Apply a transition and/or field update, then persist the result
    async fn update<F>(&self, entry: &ServiceEntry, status: Option<ServiceStatus>, apply: F) -> Result<()>
    where
        F: FnOnce(&mut ServiceState),
    {
        let snapshot = {
            let mut state = entry.state.lock().await;
            if let Some(next) = status {
                if state.status != next && !state.transition_to(next) {
                    return Err(Error::Internal(format!(
                        "invalid transition {} -> {} for service {}",
                        state.status.as_str(),
                        next.as_str(),
                        entry.config.id
                    )));
                }
            }
            apply(&mut state);
            state.updated_at = Utc::now();
            state.clone()
        };
        self.persist(&entry.config.id, &snapshot).await;
        Ok(())
    }

    async fn fail(&self, entry: &ServiceEntry, message: String) {
        let id = entry.config.id.clone();
        error!(service_id = %id, "Service error: {}", message);
        let recorded = message.clone();
        if let Err(e) = self
            .update(entry, Some(ServiceStatus::Error), |s| s.last_error = Some(recorded))
            .await
        {
            warn!(service_id = %id, "{}", e);
        }
        self.emit(LifecycleEvent::Error {
            service_id: id,
            message,
        })
        .await;
    }

    /// Start a service. Succeeds without doing anything when it is already
    /// running; fails when a dependency is not running.
    pub async fn start(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;
        self.start_locked(&entry).await
    }

    async fn start_locked(&self, entry: &Arc<ServiceEntry>) -> Result<()> {
        let id = &entry.config.id;
        if entry.state.lock().await.status == ServiceStatus::Running {
            debug!(service_id = %id, "Service already running");
            return Ok(());
        }
        if !entry.config.enabled {
            return Err(Error::InvalidServiceConfig(format!("service {} is disabled", id)));
        }

        for dependency in &entry.config.dependencies {
            let running = match self.inner.services.get(dependency).map(|e| e.value().clone()) {
                Some(dep) => dep.state.lock().await.status == ServiceStatus::Running,
                None => false,
            };
            if !running {
                let err = Error::DependencyNotRunning(format!("{} requires {}", id, dependency));
                warn!(service_id = %id, dependency = %dependency, "Dependency not running");
                let message = err.to_string();
                self.update(entry, None, |s| s.last_error = Some(message)).await?;
                return Err(err);
            }
        }

        // operator start refills the auto-restart budget
        self.update(entry, None, |s| s.auto_restarts = 0).await?;
        entry.cancel_health_loop().await;
        self.bring_up(entry).await?;

        let handle = self.spawn_health_loop(entry);
        *entry.health_task.lock().await = Some(handle);
        Ok(())
    }

    /// Run the driver's start and walk the state to running or error
    async fn bring_up(&self, entry: &ServiceEntry) -> Result<()> {
        let id = entry.config.id.clone();
        self.update(entry, Some(ServiceStatus::Starting), |s| {
            s.health = HealthStatus::Starting;
        })
        .await?;
        info!(service_id = %id, kind = entry.config.kind.as_str(), "Starting service");
        self.emit(LifecycleEvent::Starting {
            service_id: id.clone(),
        })
        .await;

        match entry.driver.start(&entry.config).await {
            Ok(container_id) => {
                self.update(entry, Some(ServiceStatus::Running), |s| {
                    s.container_id = container_id;
                    s.started_at = Some(Utc::now());
                })
                .await?;
                info!(service_id = %id, "Service started");
                self.emit(LifecycleEvent::Started { service_id: id }).await;
                Ok(())
            }
            Err(e) => {
                self.fail(entry, format!("start failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Stop a service. Succeeds without teardown when already stopped.
    pub async fn stop(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;
        self.stop_locked(&entry).await
    }

    async fn stop_locked(&self, entry: &ServiceEntry) -> Result<()> {
        // before teardown so a probe cannot race it into an auto-restart
        entry.cancel_health_loop().await;

        if entry.state.lock().await.status == ServiceStatus::Stopped {
            debug!(service_id = %entry.config.id, "Service already stopped");
            return Ok(());
        }
        self.teardown(entry).await
    }

    /// Run the driver's stop and walk the state to stopped or error
    async fn teardown(&self, entry: &ServiceEntry) -> Result<()> {
        let id = entry.config.id.clone();
        let container_id = entry.state.lock().await.container_id.clone();

        self.update(entry, Some(ServiceStatus::Stopping), |_| {}).await?;
        info!(service_id = %id, "Stopping service");
        self.emit(LifecycleEvent::Stopping {
            service_id: id.clone(),
        })
        .await;

        match entry.driver.stop(&entry.config, container_id.as_deref()).await {
            Ok(()) => {
                self.update(entry, Some(ServiceStatus::Stopped), |s| {
                    s.container_id = None;
                    s.started_at = None;
                    s.health = HealthStatus::Unknown;
                })
                .await?;
                info!(service_id = %id, "Service stopped");
                self.emit(LifecycleEvent::Stopped { service_id: id }).await;
                Ok(())
            }
            Err(e) => {
                self.fail(entry, format!("stop failed: {}", e)).await;
                Err(e)
            }
        }
    }

    /// Stop, wait the settle delay, start again
    pub async fn restart(&self, id: &str) -> Result<()> {
        let entry = self.entry(id)?;
        let _op = entry.op_lock.lock().await;
        info!(service_id = %id, "Restarting service");

        self.stop_locked(&entry).await?;
        tokio::time::sleep(self.inner.restart_settle).await;
        self.update(&entry, None, |s| s.restart_count += 1).await?;
        self.start_locked(&entry).await
    }

    /// One health-check iteration. An unhealthy result triggers an
    /// auto-restart while the budget lasts; afterwards the service is left
    /// in error.
    pub async fn check_health(&self, id: &str) -> Result<HealthStatus> {
        let entry = self.entry(id)?;
        Ok(self.health_tick(&entry).await.0)
    }

    /// Returns the observed health and whether the loop should keep polling
    async fn health_tick(&self, entry: &ServiceEntry) -> (HealthStatus, bool) {
        let _op = entry.op_lock.lock().await;
        let (status, container_id, last_error) = {
            let state = entry.state.lock().await;
            (state.status, state.container_id.clone(), state.last_error.clone())
        };

        match status {
            ServiceStatus::Running => {
                let (health, probe_error) =
                    match entry.driver.health(&entry.config, container_id.as_deref()).await {
                        Ok(health) => (health, None),
                        Err(e) => (HealthStatus::Unhealthy, Some(e.to_string())),
                    };
                if let Err(e) = self
                    .update(entry, None, |s| {
                        s.health = health;
                        s.last_health_check = Some(Utc::now());
                    })
                    .await
                {
                    warn!(service_id = %entry.config.id, "{}", e);
                }

                if !health.is_unhealthy() {
                    return (health, true);
                }
                let reason = probe_error
                    .unwrap_or_else(|| format!("health check reported {}", health.as_str()));
                warn!(service_id = %entry.config.id, "Service unhealthy: {}", reason);
                self.recover(entry, reason).await
            }
            ServiceStatus::Error => {
                let reason = last_error.unwrap_or_else(|| "service in error state".to_string());
                self.recover(entry, reason).await
            }
            _ => (entry.state.lock().await.health, false),
        }
    }

    async fn recover(&self, entry: &ServiceEntry, reason: String) -> (HealthStatus, bool) {
        let id = entry.config.id.clone();
        let (status, auto_restarts) = {
            let state = entry.state.lock().await;
            (state.status, state.auto_restarts)
        };

        if !entry.config.restart_on_failure || auto_restarts >= entry.config.max_restarts {
            if status != ServiceStatus::Error {
                self.fail(entry, reason).await;
            }
            if entry.config.restart_on_failure {
                error!(
                    service_id = %id,
                    max_restarts = entry.config.max_restarts,
                    "Restart budget exhausted, manual restart required"
                );
            }
            return (HealthStatus::Unhealthy, false);
        }

        let attempt = auto_restarts + 1;
        warn!(
            service_id = %id,
            attempt,
            max_restarts = entry.config.max_restarts,
            "Auto-restarting service"
        );
        if let Err(e) = self
            .update(entry, None, |s| {
                s.restart_count += 1;
                s.auto_restarts += 1;
                s.last_error = Some(reason);
            })
            .await
        {
            warn!(service_id = %id, "{}", e);
        }

        if let Err(e) = self.teardown(entry).await {
            warn!(service_id = %id, "Teardown before restart failed: {}", e);
        }
        match self.bring_up(entry).await {
            Ok(()) => (entry.state.lock().await.health, true),
            Err(e) => {
                warn!(service_id = %id, "Auto-restart failed: {}", e);
                (HealthStatus::Unhealthy, true)
            }
        }
    }

    fn spawn_health_loop(&self, entry: &ServiceEntry) -> JoinHandle<()> {
        let inner: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let id = entry.config.id.clone();
        let interval = entry.config.health_interval();

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let manager = ServiceManager { inner };
                let Ok(entry) = manager.entry(&id) else {
                    break;
                };
                let (health, keep_polling) = manager.health_tick(&entry).await;
                debug!(service_id = %id, health = health.as_str(), "Health check");
                if !keep_polling {
                    break;
                }
            }
            debug!(service_id = %id, "Health loop ended");
        })
    }

    /// Start every enabled auto-start service, dependencies first
    pub async fn start_auto(&self) -> Vec<String> {
        let mut pending: Vec<Arc<ServiceEntry>> = Vec::new();
        for id in self.inner.order.read().await.iter() {
            if let Ok(entry) = self.entry(id) {
                if entry.config.enabled && entry.config.auto_start {
                    pending.push(entry);
                }
            }
        }

        let mut started = Vec::new();
        loop {
            let mut progressed = false;
            let mut waiting = Vec::new();
            for entry in pending {
                if self.dependencies_running(&entry).await {
                    progressed = true;
                    match self.start(&entry.config.id).await {
                        Ok(()) => started.push(entry.config.id.clone()),
                        Err(e) => error!(service_id = %entry.config.id, "Auto-start failed: {}", e),
                    }
                } else {
                    waiting.push(entry);
                }
            }
            pending = waiting;
            if pending.is_empty() || !progressed {
                break;
            }
        }

        // never satisfiable: record the gate failure on each
        for entry in pending {
            if let Err(e) = self.start(&entry.config.id).await {
                error!(service_id = %entry.config.id, "Auto-start failed: {}", e);
            }
        }
        started
    }

    async fn dependencies_running(&self, entry: &ServiceEntry) -> bool {
        for dependency in &entry.config.dependencies {
            let Some(dep) = self.inner.services.get(dependency).map(|e| e.value().clone()) else {
                return false;
            };
            if dep.state.lock().await.status != ServiceStatus::Running {
                return false;
            }
        }
        true
    }

    /// Stop every service in reverse registration order
    pub async fn shutdown(&self) {
        let order = self.inner.order.read().await.clone();
        for id in order.iter().rev() {
            if let Err(e) = self.stop(id).await {
                error!(service_id = %id, "Failed to stop service during shutdown: {}", e);
            }
        }
        info!("All services stopped");
    }

    pub async fn get(&self, id: &str) -> Result<ServiceSummary> {
        Ok(self.entry(id)?.summary().await)
    }

    /// Full lifecycle state of one service
    pub async fn state(&self, id: &str) -> Result<ServiceState> {
        Ok(self.entry(id)?.state.lock().await.clone())
    }

    pub fn config(&self, id: &str) -> Result<ServiceConfig> {
        Ok(self.entry(id)?.config.clone())
    }

    pub async fn list(&self) -> Vec<ServiceSummary> {
        let order = self.inner.order.read().await.clone();
        let mut summaries = Vec::with_capacity(order.len());
        for id in order {
            if let Ok(entry) = self.entry(&id) {
                summaries.push(entry.summary().await);
            }
        }
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::ContainerDeployment;
    use crate::infra::docker::MockContainerRuntime;
    use crate::infra::sqlite::tests::create_test_pool;
    use crate::service::orchestrator::parse_ps;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Driver whose health answer is scripted by the test
    struct FakeDriver {
        starts: AtomicUsize,
        stops: AtomicUsize,
        health: std::sync::Mutex<HealthStatus>,
        fail_start: bool,
    }

    impl FakeDriver {
        fn new(health: HealthStatus) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                health: std::sync::Mutex::new(health),
                fail_start: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                health: std::sync::Mutex::new(HealthStatus::Unknown),
                fail_start: true,
            })
        }
    }

    #[async_trait]
    impl ServiceDriver for FakeDriver {
        async fn start(&self, _config: &ServiceConfig) -> Result<Option<String>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(Error::ServiceStartFailed("boom".to_string()));
            }
            Ok(Some("c0ffee".to_string()))
        }

        async fn stop(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn health(&self, _config: &ServiceConfig, _container_id: Option<&str>) -> Result<HealthStatus> {
            Ok(*self.health.lock().unwrap())
        }
    }

    fn test_config() -> Config {
        Config {
            restart_settle_ms: 10,
            ..Config::default()
        }
    }

    fn manager(repository: Option<ServiceStateRepository>) -> ServiceManager {
        let orchestrator = Arc::new(Orchestrator::unavailable(Path::new("docker-compose.yml")));
        ServiceManager::new(&test_config(), repository, None, orchestrator)
    }

    fn service(id: &str) -> ServiceConfig {
        let mut config = ServiceConfig::new(id, ServiceKind::Internal);
        // keep the background loop out of the way
        config.health_check_interval = 3600;
        config
    }

    #[tokio::test]
    async fn test_restart_budget_is_bounded() {
        let manager = manager(None);
        let driver = FakeDriver::new(HealthStatus::Unhealthy);
        let mut config = service("ollama");
        config.max_restarts = 3;
        manager.register_with_driver(config, driver.clone()).await.unwrap();
        manager.start("ollama").await.unwrap();

        for attempt in 1..=3 {
            manager.check_health("ollama").await.unwrap();
            let state = manager.state("ollama").await.unwrap();
            assert_eq!(state.status, ServiceStatus::Running);
            assert_eq!(state.restart_count, attempt);
        }
        assert_eq!(driver.starts.load(Ordering::SeqCst), 4);

        let health = manager.check_health("ollama").await.unwrap();
        assert_eq!(health, HealthStatus::Unhealthy);
        let state = manager.state("ollama").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Error);
        assert_eq!(state.restart_count, 3);
        assert!(state.last_error.is_some());
        // no further attempt
        assert_eq!(driver.starts.load(Ordering::SeqCst), 4);

        // operator start refills the budget
        manager.start("ollama").await.unwrap();
        assert_eq!(manager.state("ollama").await.unwrap().auto_restarts, 0);
    }

    #[tokio::test]
    async fn test_healthy_check_does_not_restart() {
        let manager = manager(None);
        let driver = FakeDriver::new(HealthStatus::Healthy);
        manager.register_with_driver(service("db"), driver.clone()).await.unwrap();
        manager.start("db").await.unwrap();

        assert_eq!(manager.check_health("db").await.unwrap(), HealthStatus::Healthy);
        let state = manager.state("db").await.unwrap();
        assert_eq!(state.restart_count, 0);
        assert!(state.last_health_check.is_some());
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let manager = manager(None);
        let driver = FakeDriver::new(HealthStatus::Healthy);
        manager.register_with_driver(service("api"), driver.clone()).await.unwrap();

        manager.stop("api").await.unwrap();
        assert_eq!(driver.stops.load(Ordering::SeqCst), 0);

        manager.start("api").await.unwrap();
        manager.start("api").await.unwrap();
        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.state("api").await.unwrap().container_id.as_deref(),
            Some("c0ffee")
        );

        manager.stop("api").await.unwrap();
        manager.stop("api").await.unwrap();
        assert_eq!(driver.stops.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state("api").await.unwrap().status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_dependency_gate_does_not_start_dependency() {
        let manager = manager(None);
        let db = FakeDriver::new(HealthStatus::Healthy);
        let api = FakeDriver::new(HealthStatus::Healthy);
        manager.register_with_driver(service("db"), db.clone()).await.unwrap();
        let mut config = service("api");
        config.dependencies = vec!["db".to_string()];
        manager.register_with_driver(config, api.clone()).await.unwrap();

        let err = manager.start("api").await.unwrap_err();
        assert!(matches!(err, Error::DependencyNotRunning(_)));
        assert_eq!(db.starts.load(Ordering::SeqCst), 0);
        assert_eq!(manager.state("db").await.unwrap().status, ServiceStatus::Stopped);
        assert_eq!(manager.state("api").await.unwrap().status, ServiceStatus::Stopped);

        manager.start("db").await.unwrap();
        manager.start("api").await.unwrap();
        assert_eq!(manager.state("api").await.unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_failed_start_records_error() {
        let manager = manager(None);
        manager
            .register_with_driver(service("broken"), FakeDriver::failing())
            .await
            .unwrap();

        assert!(manager.start("broken").await.is_err());
        let summary = manager.get("broken").await.unwrap();
        assert_eq!(summary.status, ServiceStatus::Error);
        assert!(summary.last_error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_container_kind_without_runtime_is_unavailable() {
        let manager = manager(None);
        let config = ServiceConfig::new("ollama", ServiceKind::Container(Default::default()));
        manager.register(config).await.unwrap();

        let err = manager.start("ollama").await.unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(manager.state("ollama").await.unwrap().status, ServiceStatus::Error);
    }

    #[tokio::test]
    async fn test_observers_see_events_and_cannot_break_lifecycle() {
        let manager = manager(None);
        let mut events = manager.subscribe();
        manager.on(|_| Err(anyhow::anyhow!("alerting down"))).await;
        manager.on(|_| panic!("observer bug")).await;
        manager
            .register_with_driver(service("api"), FakeDriver::new(HealthStatus::Healthy))
            .await
            .unwrap();

        manager.start("api").await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Starting {
                service_id: "api".to_string()
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            LifecycleEvent::Started {
                service_id: "api".to_string()
            }
        );
        assert_eq!(manager.state("api").await.unwrap().status, ServiceStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_cancels_health_loop() {
        let manager = manager(None);
        let driver = FakeDriver::new(HealthStatus::Unhealthy);
        let mut config = service("flaky");
        config.health_check_interval = 1;
        manager.register_with_driver(config, driver.clone()).await.unwrap();

        manager.start("flaky").await.unwrap();
        manager.stop("flaky").await.unwrap();
        tokio::time::sleep(Duration::from_millis(1300)).await;

        assert_eq!(driver.starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.state("flaky").await.unwrap().status, ServiceStatus::Stopped);
    }

    #[tokio::test]
    async fn test_state_is_persisted_and_restored() {
        let pool = create_test_pool().await;
        let first = manager(Some(ServiceStateRepository::new(pool.clone())));
        first
            .register_with_driver(service("cache"), FakeDriver::new(HealthStatus::Healthy))
            .await
            .unwrap();
        first.start("cache").await.unwrap();
        first.restart("cache").await.unwrap();

        let persisted = ServiceStateRepository::new(pool.clone())
            .get("cache")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted.state.status, ServiceStatus::Running);
        assert_eq!(persisted.state.restart_count, 1);

        let second = manager(Some(ServiceStateRepository::new(pool)));
        second
            .register_with_driver(service("cache"), FakeDriver::new(HealthStatus::Healthy))
            .await
            .unwrap();
        let state = second.state("cache").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.last_known_status, Some(ServiceStatus::Running));
    }

    #[tokio::test]
    async fn test_start_auto_orders_dependencies() {
        let manager = manager(None);
        let mut app = service("app");
        app.dependencies = vec!["zdb".to_string()];
        let mut manual = service("manual");
        manual.auto_start = false;
        manager
            .register_with_driver(app, FakeDriver::new(HealthStatus::Healthy))
            .await
            .unwrap();
        manager
            .register_with_driver(manual, FakeDriver::new(HealthStatus::Healthy))
            .await
            .unwrap();
        manager
            .register_with_driver(service("zdb"), FakeDriver::new(HealthStatus::Healthy))
            .await
            .unwrap();

        let started = manager.start_auto().await;
        assert_eq!(started, vec!["zdb".to_string(), "app".to_string()]);
        assert_eq!(manager.state("manual").await.unwrap().status, ServiceStatus::Stopped);

        manager.shutdown().await;
        for summary in manager.list().await {
            assert_eq!(summary.status, ServiceStatus::Stopped);
        }
    }

    #[tokio::test]
    async fn test_load_services_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.toml");
        std::fs::write(
            &path,
            r#"
[services.ollama]
name = "Ollama"
type = "container"
image = "ollama/ollama:latest"
ports = [11434]
max_restarts = 5

[services.watcher]
type = "external"
health_command = ["true"]
dependencies = ["ollama"]
"#,
        )
        .unwrap();

        let manager = manager(None);
        let ids = manager.load_services(&path).await.unwrap();
        assert_eq!(ids, vec!["ollama".to_string(), "watcher".to_string()]);

        let ollama = manager.config("ollama").unwrap();
        assert_eq!(ollama.max_restarts, 5);
        assert!(matches!(ollama.kind, ServiceKind::Container(_)));
        let watcher = manager.get("watcher").await.unwrap();
        assert_eq!(watcher.kind, "external");
        assert_eq!(watcher.name, "watcher");
    }

    fn container_manager(runtime: MockContainerRuntime) -> ServiceManager {
        let orchestrator = Arc::new(Orchestrator::unavailable(Path::new("docker-compose.yml")));
        ServiceManager::new(&test_config(), None, Some(Arc::new(runtime)), orchestrator)
    }

    fn container_service(id: &str, deployment: ContainerDeployment) -> ServiceConfig {
        let mut config = ServiceConfig::new(id, ServiceKind::Container(deployment));
        config.health_check_interval = 3600;
        config
    }

    #[tokio::test]
    async fn test_container_service_replaces_leftover_and_removes_on_stop() {
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_remove_container()
            .withf(|id| id == "appvisor-ollama")
            .times(1)
            .returning(|_| Ok(()));
        runtime
            .expect_create_container()
            .withf(|opts| {
                opts.name == "appvisor-ollama"
                    && opts.image == "ollama/ollama:latest"
                    && opts.ports == vec![11434]
                    && opts.labels.get(SERVICE_LABEL_KEY).map(String::as_str) == Some("ollama")
            })
            .times(1)
            .returning(|_| Ok("c-ollama".to_string()));
        runtime
            .expect_start_container()
            .withf(|id| id == "c-ollama")
            .times(1)
            .returning(|_| Ok(()));
        runtime
            .expect_stop_container()
            .withf(|id, timeout| id == "c-ollama" && *timeout == STOP_TIMEOUT_SECS)
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_remove_container()
            .withf(|id| id == "c-ollama")
            .times(1)
            .returning(|_| Ok(()));

        let manager = container_manager(runtime);
        let deployment = ContainerDeployment {
            image: Some("ollama/ollama:latest".to_string()),
            ports: vec![11434],
            ..Default::default()
        };
        manager
            .register(container_service("ollama", deployment))
            .await
            .unwrap();

        manager.start("ollama").await.unwrap();
        let state = manager.state("ollama").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.container_id.as_deref(), Some("c-ollama"));

        manager.stop("ollama").await.unwrap();
        let state = manager.state("ollama").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Stopped);
        assert!(state.container_id.is_none());
    }

    #[tokio::test]
    async fn test_unhealthy_container_is_auto_restarted() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_remove_container().returning(|_| Ok(()));
        runtime
            .expect_create_container()
            .withf(|opts| opts.image == "appvisor/ollama:latest")
            .times(2)
            .returning(|_| Ok("c-1".to_string()));
        runtime
            .expect_start_container()
            .times(2)
            .returning(|_| Ok(()));
        runtime
            .expect_stop_container()
            .times(1)
            .returning(|_, _| Ok(()));
        let mut probes = 0;
        runtime
            .expect_container_health()
            .withf(|id| id == "c-1")
            .times(2)
            .returning(move |_| {
                probes += 1;
                Ok(if probes == 1 {
                    HealthStatus::Unhealthy
                } else {
                    HealthStatus::Healthy
                })
            });

        let manager = container_manager(runtime);
        manager
            .register(container_service("ollama", ContainerDeployment::default()))
            .await
            .unwrap();
        manager.start("ollama").await.unwrap();

        manager.check_health("ollama").await.unwrap();
        let state = manager.state("ollama").await.unwrap();
        assert_eq!(state.status, ServiceStatus::Running);
        assert_eq!(state.restart_count, 1);
        assert_eq!(state.auto_restarts, 1);

        assert_eq!(
            manager.check_health("ollama").await.unwrap(),
            HealthStatus::Healthy
        );
        assert_eq!(manager.state("ollama").await.unwrap().restart_count, 1);
    }

    #[test]
    fn test_compose_health_looks_up_service_name() {
        let containers = parse_ps(concat!(
            r#"{"ID":"a1","Name":"stack-llm-1","Image":"ollama/ollama","State":"running","Status":"Up 2 minutes (healthy)","Service":"llm"}"#,
            "\n",
            r#"{"ID":"b2","Name":"stack-redis-1","Image":"redis:7","State":"running","Status":"Up 2 minutes (unhealthy)","Service":"redis"}"#,
        ));
        assert_eq!(containers.len(), 2);

        let named = ServiceConfig::new(
            "ollama",
            ServiceKind::Compose {
                compose_service: Some("llm".to_string()),
            },
        );
        assert_eq!(ComposeDriver::target(&named), "llm");
        assert_eq!(
            stack_health(&containers, &ComposeDriver::target(&named)),
            HealthStatus::Healthy
        );

        let by_id = ServiceConfig::new("redis", ServiceKind::Compose { compose_service: None });
        assert_eq!(ComposeDriver::target(&by_id), "redis");
        assert_eq!(
            stack_health(&containers, &ComposeDriver::target(&by_id)),
            HealthStatus::Unhealthy
        );

        // no container for the service at all
        assert_eq!(stack_health(&containers, "ollama"), HealthStatus::Unhealthy);
    }
}
