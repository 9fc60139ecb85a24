//! Service domain model

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Service lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(ServiceStatus::Stopped),
            "starting" => Some(ServiceStatus::Starting),
            "running" => Some(ServiceStatus::Running),
            "stopping" => Some(ServiceStatus::Stopping),
            "error" => Some(ServiceStatus::Error),
            _ => None,
        }
    }
}

/// Result of the most recent health probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    /// Running, but the backend reports no health information
    Running,
    Starting,
    Unhealthy,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Running => "running",
            HealthStatus::Starting => "starting",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "healthy" => HealthStatus::Healthy,
            "running" => HealthStatus::Running,
            "starting" => HealthStatus::Starting,
            "unhealthy" => HealthStatus::Unhealthy,
            _ => HealthStatus::Unknown,
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        *self == HealthStatus::Unhealthy
    }
}

/// Deployment parameters for container-backed services
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerDeployment {
    /// Image; defaults to `appvisor/<id>:latest`
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Ports published 1:1 on the host
    #[serde(default)]
    pub ports: Vec<u16>,
    /// `host:container[:mode]` bind specs
    #[serde(default)]
    pub volumes: Vec<String>,
}

/// How a service is realized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceKind {
    /// In-process component owned by the host application
    Internal,
    /// Long-running container managed through the Docker API
    Container(ContainerDeployment),
    /// Managed elsewhere; supervised only through an optional probe command
    External {
        #[serde(default)]
        health_command: Option<Vec<String>>,
    },
    /// Member of the compose stack driven by the orchestrator
    Compose {
        /// Compose service name; defaults to the service id
        #[serde(default)]
        compose_service: Option<String>,
    },
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Internal => "internal",
            ServiceKind::Container(_) => "container",
            ServiceKind::External { .. } => "external",
            ServiceKind::Compose { .. } => "compose",
        }
    }
}

/// Declared service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(flatten)]
    pub kind: ServiceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Seconds between health probes
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
    #[serde(default = "default_true")]
    pub restart_on_failure: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_max_restarts() -> u32 {
    3
}

impl ServiceConfig {
    pub fn new(id: impl Into<String>, kind: ServiceKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            enabled: true,
            auto_start: true,
            health_check_interval: default_health_check_interval(),
            restart_on_failure: true,
            max_restarts: default_max_restarts(),
            dependencies: Vec::new(),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval.max(1))
    }

    /// Name of the backing container for container-backed services
    pub fn container_name(&self) -> String {
        format!("appvisor-{}", self.id)
    }
}

/// Runtime state of a service
#[derive(Debug, Clone, Serialize)]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub health: HealthStatus,
    /// Lifetime restart counter, never decreases
    pub restart_count: u32,
    /// Automatic restarts since the last operator start; measured against the budget
    pub auto_restarts: u32,
    pub container_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Status persisted by a previous supervisor run
    pub last_known_status: Option<ServiceStatus>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            health: HealthStatus::Unknown,
            restart_count: 0,
            auto_restarts: 0,
            container_id: None,
            started_at: None,
            last_health_check: None,
            last_error: None,
            last_known_status: None,
            updated_at: Utc::now(),
        }
    }
}

impl ServiceState {
    /// Transition to a new status
    pub fn transition_to(&mut self, new_status: ServiceStatus) -> bool {
        let valid_transition = match (self.status, new_status) {
            // From Stopped
            (ServiceStatus::Stopped, ServiceStatus::Starting) => true,
            // From Starting
            (ServiceStatus::Starting, ServiceStatus::Running) => true,
            (ServiceStatus::Starting, ServiceStatus::Error) => true,
            // From Running
            (ServiceStatus::Running, ServiceStatus::Stopping) => true,
            (ServiceStatus::Running, ServiceStatus::Error) => true,
            // From Stopping
            (ServiceStatus::Stopping, ServiceStatus::Stopped) => true,
            (ServiceStatus::Stopping, ServiceStatus::Error) => true,
            // From Error: manual recovery or teardown
            (ServiceStatus::Error, ServiceStatus::Starting) => true,
            (ServiceStatus::Error, ServiceStatus::Stopping) => true,
            // No other transitions allowed
            _ => false,
        };

        if valid_transition {
            self.status = new_status;
            self.updated_at = Utc::now();
        }

        valid_transition
    }
}

/// Lifecycle notification delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Starting { service_id: String },
    Started { service_id: String },
    Stopping { service_id: String },
    Stopped { service_id: String },
    Error { service_id: String, message: String },
}

impl LifecycleEvent {
    pub fn service_id(&self) -> &str {
        match self {
            LifecycleEvent::Starting { service_id }
            | LifecycleEvent::Started { service_id }
            | LifecycleEvent::Stopping { service_id }
            | LifecycleEvent::Stopped { service_id }
            | LifecycleEvent::Error { service_id, .. } => service_id,
        }
    }
}

/// Row shown by service listings
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSummary {
    pub id: String,
    pub name: String,
    pub kind: &'static str,
    pub enabled: bool,
    pub status: ServiceStatus,
    pub health: HealthStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions() {
        let mut state = ServiceState::default();
        assert!(!state.transition_to(ServiceStatus::Running));
        assert!(state.transition_to(ServiceStatus::Starting));
        assert!(state.transition_to(ServiceStatus::Running));
        assert!(state.transition_to(ServiceStatus::Error));
        // operator recovery
        assert!(state.transition_to(ServiceStatus::Starting));
        assert!(state.transition_to(ServiceStatus::Running));
        assert!(state.transition_to(ServiceStatus::Stopping));
        assert!(!state.transition_to(ServiceStatus::Running));
        assert!(state.transition_to(ServiceStatus::Stopped));
    }

    #[test]
    fn test_service_config_from_json_with_kind_tag() {
        let json = r#"{
            "id": "ollama",
            "name": "Ollama",
            "type": "container",
            "image": "ollama/ollama:latest",
            "ports": [11434],
            "max_restarts": 5
        }"#;
        let config: ServiceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.max_restarts, 5);
        assert!(config.restart_on_failure);
        assert_eq!(config.health_check_interval, 30);
        match config.kind {
            ServiceKind::Container(deploy) => {
                assert_eq!(deploy.image.as_deref(), Some("ollama/ollama:latest"));
                assert_eq!(deploy.ports, vec![11434]);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let json = r#"{"id": "x", "type": "quantum"}"#;
        assert!(serde_json::from_str::<ServiceConfig>(json).is_err());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            ServiceStatus::Stopped,
            ServiceStatus::Starting,
            ServiceStatus::Running,
            ServiceStatus::Stopping,
            ServiceStatus::Error,
        ] {
            assert_eq!(ServiceStatus::from_str(status.as_str()), Some(status));
        }
    }
}
