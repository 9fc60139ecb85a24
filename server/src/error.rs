//! Error types for the supervisor

use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure class reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed manifest, missing script, unmet dependency
    Configuration,
    /// Could not spawn, runtime absent, permission denied ("unavailable")
    Infra,
    /// The unit ran and reported failure
    Domain,
    /// The unit was killed after exceeding its wall-clock budget
    Timeout,
    /// A request tried to escape its containment boundary
    Security,
    /// Unknown app, service or sandbox id
    NotFound,
}

/// Main error type for the supervisor
#[derive(Debug, Error)]
pub enum Error {
    // Registry errors (2000-2999)
    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("App disabled: {0}")]
    AppDisabled(String),

    #[error("Invalid manifest {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("Path escapes app directory: {0}")]
    PathNotAllowed(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    // Execution errors (3000-3999)
    #[error("Process could not be started: {0}")]
    SpawnFailed(String),

    #[error("Process timed out after {0}s")]
    ProcessTimeout(u64),

    #[error("Process execution failed: {0}")]
    ProcessExecutionFailed(String),

    // Sandbox errors (4000-4999)
    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Sandbox in invalid state: expected {expected}, got {actual}")]
    InvalidSandboxState { expected: String, actual: String },

    #[error("Isolation unavailable: {0}")]
    IsolationUnavailable(String),

    // Service errors (5000-5999)
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Dependency not running: {0}")]
    DependencyNotRunning(String),

    #[error("Service failed to start: {0}")]
    ServiceStartFailed(String),

    #[error("Invalid service configuration: {0}")]
    InvalidServiceConfig(String),

    // Infrastructure errors (6000-6999)
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Docker error: {0}")]
    DockerError(String),

    #[error("Container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    // General errors (1000-1999)
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the error code
    pub fn code(&self) -> u32 {
        match self {
            // Registry errors (2000-2999)
            Error::AppNotFound(_) => 2001,
            Error::AppDisabled(_) => 2002,
            Error::InvalidManifest { .. } => 2003,
            Error::ScriptNotFound(_) => 2004,
            Error::PathNotAllowed(_) => 2005,
            Error::FileNotFound(_) => 2006,

            // Execution errors (3000-3999)
            Error::SpawnFailed(_) => 3001,
            Error::ProcessTimeout(_) => 3002,
            Error::ProcessExecutionFailed(_) => 3003,

            // Sandbox errors (4000-4999)
            Error::SandboxNotFound(_) => 4001,
            Error::InvalidSandboxState { .. } => 4002,
            Error::IsolationUnavailable(_) => 4003,

            // Service errors (5000-5999)
            Error::ServiceNotFound(_) => 5001,
            Error::DependencyNotRunning(_) => 5002,
            Error::ServiceStartFailed(_) => 5003,
            Error::InvalidServiceConfig(_) => 5004,

            // Infrastructure errors (6000-6999)
            Error::DatabaseError(_) => 6001,
            Error::DockerError(_) => 6002,
            Error::RuntimeUnavailable(_) => 6003,

            // General errors (1000-1999)
            Error::InvalidParameter(_) => 1001,
            Error::Internal(_) => 1002,
        }
    }

    /// Map the error onto the caller-facing taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AppNotFound(_) | Error::SandboxNotFound(_) | Error::ServiceNotFound(_) => {
                ErrorKind::NotFound
            }

            Error::AppDisabled(_)
            | Error::InvalidManifest { .. }
            | Error::ScriptNotFound(_)
            | Error::FileNotFound(_)
            | Error::DependencyNotRunning(_)
            | Error::InvalidServiceConfig(_)
            | Error::InvalidSandboxState { .. }
            | Error::InvalidParameter(_) => ErrorKind::Configuration,

            Error::PathNotAllowed(_) => ErrorKind::Security,

            Error::ProcessTimeout(_) => ErrorKind::Timeout,

            Error::ProcessExecutionFailed(_) | Error::ServiceStartFailed(_) => ErrorKind::Domain,

            Error::SpawnFailed(_)
            | Error::IsolationUnavailable(_)
            | Error::DatabaseError(_)
            | Error::DockerError(_)
            | Error::RuntimeUnavailable(_)
            | Error::Internal(_) => ErrorKind::Infra,
        }
    }

    /// True when the failure means "could not even try" rather than "tried and failed"
    pub fn is_unavailable(&self) -> bool {
        self.kind() == ErrorKind::Infra
    }
}

/// Error body carried by an [`Outcome`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub code: u32,
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Uniform `{success, error?, data?}` shape returned at component boundaries
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> Outcome<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }

    pub fn err(err: &Error) -> Self {
        Self {
            success: false,
            error: Some(err.into()),
            data: None,
        }
    }

    /// Failure that still carries the data produced before failing
    pub fn failed(err: &Error, data: T) -> Self {
        Self {
            success: false,
            error: Some(err.into()),
            data: Some(data),
        }
    }

    /// Error kind, if this outcome is a failure
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}

impl<T> From<Result<T>> for Outcome<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(data) => Outcome::ok(data),
            Err(e) => Outcome::err(&e),
        }
    }
}

// Implement From for common error types
impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for Error {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::DockerError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidServiceConfig(err.to_string())
    }
}
