//! Sandbox domain model

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::execution::ExecutionResult;
use crate::error::{Error, Result};

/// Sandbox state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Registered, nothing running
    Idle,
    /// Preparing the isolation context for a run
    Creating,
    /// A command is executing
    Running,
    /// Last run finished successfully
    Stopped,
    /// Last run failed, timed out, or could not be set up
    Error,
}

impl SandboxState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxState::Idle => "idle",
            SandboxState::Creating => "creating",
            SandboxState::Running => "running",
            SandboxState::Stopped => "stopped",
            SandboxState::Error => "error",
        }
    }
}

/// How a sandbox isolates its command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationKind {
    /// Bare process: scoped env, rlimits, private netns. Weaker guarantees.
    Process,
    /// Throwaway container with hard memory/CPU/filesystem limits
    Container,
}

/// Resource envelope, fixed at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Requested isolation
    pub isolation: IsolationKind,
    /// Memory ceiling, docker-style size ("512m", "1g")
    pub memory_limit: String,
    /// CPU share in cores
    pub cpu_limit: f64,
    /// Wall-clock timeout in seconds
    pub timeout: u64,
    /// Allow outbound network
    pub network: bool,
    /// Read-only root filesystem
    pub read_only: bool,
    /// Host paths exposed read-only
    pub allowed_paths: Vec<String>,
    pub environment: HashMap<String, String>,
    /// Size cap of the writable scratch area
    pub scratch_size: String,
    /// Permit running under process isolation when no container runtime exists
    pub allow_process_fallback: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation: IsolationKind::Container,
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            timeout: 300,
            network: false,
            read_only: true,
            allowed_paths: Vec::new(),
            environment: HashMap::new(),
            scratch_size: "64m".to_string(),
            allow_process_fallback: false,
        }
    }
}

impl SandboxConfig {
    pub fn memory_bytes(&self) -> Result<u64> {
        parse_size(&self.memory_limit)
    }

    pub fn scratch_bytes(&self) -> Result<u64> {
        parse_size(&self.scratch_size)
    }

    /// Reject envelopes that cannot be enforced
    pub fn validate(&self) -> Result<()> {
        self.memory_bytes()?;
        self.scratch_bytes()?;
        if !(self.cpu_limit > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "cpu_limit must be positive, got {}",
                self.cpu_limit
            )));
        }
        if self.timeout == 0 {
            return Err(Error::InvalidParameter(
                "timeout must be at least one second".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a docker-style size: plain bytes or a k/m/g suffix. Sizes must fit
/// the container runtime's signed byte counts.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();
    let s = s.strip_suffix('b').unwrap_or(s.as_str());
    let (digits, multiplier) = match s.chars().last() {
        Some('k') => (&s[..s.len() - 1], 1024),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    digits
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|n| *n > 0)
        .and_then(|n| n.checked_mul(multiplier))
        .filter(|bytes| i64::try_from(*bytes).is_ok())
        .ok_or_else(|| Error::InvalidParameter(format!("invalid size: {}", s)))
}

/// Sandbox entity
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub id: String,
    pub app_id: String,
    pub config: SandboxConfig,
    pub state: SandboxState,
    /// Container backing the current run, if any
    pub container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub last_output: String,
    pub last_error: String,
    pub exit_code: Option<i32>,
}

impl Sandbox {
    /// Create a new sandbox
    pub fn new(id: String, app_id: String, config: SandboxConfig) -> Self {
        let now = Utc::now();
        Self {
            id,
            app_id,
            config,
            state: SandboxState::Idle,
            container_id: None,
            created_at: now,
            started_at: None,
            updated_at: now,
            last_output: String::new(),
            last_error: String::new(),
            exit_code: None,
        }
    }

    /// Check if the sandbox can accept a new run
    pub fn is_ready(&self) -> bool {
        matches!(self.state, SandboxState::Idle | SandboxState::Stopped)
    }

    /// Transition to a new state
    pub fn transition_to(&mut self, new_state: SandboxState) -> bool {
        let valid_transition = match (self.state, new_state) {
            // Starting a run
            (SandboxState::Idle, SandboxState::Creating) => true,
            (SandboxState::Stopped, SandboxState::Creating) => true,
            // From Creating
            (SandboxState::Creating, SandboxState::Running) => true,
            (SandboxState::Creating, SandboxState::Error) => true,
            // From Running
            (SandboxState::Running, SandboxState::Stopped) => true,
            (SandboxState::Running, SandboxState::Error) => true,
            // No other transitions allowed
            _ => false,
        };

        if valid_transition {
            self.state = new_state;
            self.updated_at = Utc::now();
            if new_state == SandboxState::Running {
                self.started_at = Some(self.updated_at);
            }
        }

        valid_transition
    }

    /// Record the captured result of a finished run
    pub fn record(&mut self, result: &ExecutionResult) {
        self.last_output = match result.output.as_raw() {
            Some(raw) => raw.to_string(),
            None => result
                .output
                .as_structured()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        };
        self.last_error = result
            .stderr
            .clone()
            .or_else(|| result.error.clone())
            .unwrap_or_default();
        self.exit_code = result.exit_code;
    }
}

/// Result of one sandboxed run
#[derive(Debug, Clone, Serialize)]
pub struct SandboxRun {
    pub sandbox_id: String,
    pub isolation: IsolationKind,
    /// Container isolation was requested but process isolation was used
    pub degraded: bool,
    /// Envelope parts the chosen isolation could not enforce
    pub warnings: Vec<String>,
    pub result: ExecutionResult,
}
