//! Supervisor configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Supervisor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory scanned for app subdirectories
    #[serde(default = "default_apps_dir")]
    pub apps_dir: PathBuf,

    /// Database URL (SQLite) for persisted service state
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Declarative service definitions (TOML, JSON or YAML)
    #[serde(default)]
    pub services_file: Option<PathBuf>,

    /// Compose file used by the orchestrator
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Docker socket path (None = platform default)
    #[serde(default)]
    pub docker_socket: Option<String>,

    /// Image used for container-isolated sandboxes
    #[serde(default = "default_sandbox_image")]
    pub sandbox_image: String,

    /// App script timeout in seconds
    #[serde(default = "default_script_timeout")]
    pub script_timeout: u64,

    /// Build-target (make) timeout in seconds
    #[serde(default = "default_make_timeout")]
    pub make_timeout: u64,

    /// Compose CLI timeout in seconds
    #[serde(default = "default_compose_timeout")]
    pub compose_timeout: u64,

    /// Per-stream cap on captured subprocess output
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Pause between stop and start on restart, in milliseconds
    #[serde(default = "default_restart_settle_ms")]
    pub restart_settle_ms: u64,

    /// Log output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

fn default_apps_dir() -> PathBuf {
    PathBuf::from("apps")
}

fn default_database_url() -> String {
    "sqlite:data/appvisor.db?mode=rwc".to_string()
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("infrastructure/docker/docker-compose.yml")
}

fn default_sandbox_image() -> String {
    "python:3.11-slim".to_string()
}

fn default_script_timeout() -> u64 {
    30
}

fn default_make_timeout() -> u64 {
    60
}

fn default_compose_timeout() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    1024 * 1024
}

fn default_restart_settle_ms() -> u64 {
    1000
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        Ok(Self::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Build a config from an arbitrary `APPVISOR_*` lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        // Start with default config as base
        let mut config = Config::default();

        // Override with environment variables
        if let Some(val) = lookup("APPVISOR_APPS_DIR") {
            config.apps_dir = PathBuf::from(val);
        }
        if let Some(val) = lookup("APPVISOR_DATABASE_URL") {
            config.database_url = val;
        }
        if let Some(val) = lookup("APPVISOR_SERVICES_FILE") {
            config.services_file = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("APPVISOR_COMPOSE_FILE") {
            config.compose_file = PathBuf::from(val);
        }
        if let Some(val) = lookup("APPVISOR_DOCKER_SOCKET") {
            config.docker_socket = Some(val);
        }
        if let Some(val) = lookup("APPVISOR_SANDBOX_IMAGE") {
            config.sandbox_image = val;
        }
        if let Some(val) = lookup("APPVISOR_SCRIPT_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.script_timeout = secs;
            }
        }
        if let Some(val) = lookup("APPVISOR_MAKE_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.make_timeout = secs;
            }
        }
        if let Some(val) = lookup("APPVISOR_COMPOSE_TIMEOUT") {
            if let Ok(secs) = val.parse() {
                config.compose_timeout = secs;
            }
        }
        if let Some(val) = lookup("APPVISOR_MAX_OUTPUT_BYTES") {
            if let Ok(bytes) = val.parse() {
                config.max_output_bytes = bytes;
            }
        }
        if let Some(val) = lookup("APPVISOR_RESTART_SETTLE_MS") {
            if let Ok(ms) = val.parse() {
                config.restart_settle_ms = ms;
            }
        }
        if let Some(val) = lookup("APPVISOR_LOG_FORMAT") {
            config.log_format = val;
        }

        config
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout)
    }

    pub fn make_timeout(&self) -> Duration {
        Duration::from_secs(self.make_timeout)
    }

    pub fn compose_timeout(&self) -> Duration {
        Duration::from_secs(self.compose_timeout)
    }

    pub fn restart_settle(&self) -> Duration {
        Duration::from_millis(self.restart_settle_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            apps_dir: default_apps_dir(),
            database_url: default_database_url(),
            services_file: None,
            compose_file: default_compose_file(),
            docker_socket: None,
            sandbox_image: default_sandbox_image(),
            script_timeout: default_script_timeout(),
            make_timeout: default_make_timeout(),
            compose_timeout: default_compose_timeout(),
            max_output_bytes: default_max_output_bytes(),
            restart_settle_ms: default_restart_settle_ms(),
            log_format: default_log_format(),
        }
    }
}
