//! Fixtures for the integration scenarios
//!
//! Every scenario builds its own apps directory, state database and
//! supervisor inside a temporary directory. No container or compose runtime
//! is assumed to be present.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use appvisor_server::infra::sqlite::ServiceStateRepository;
use appvisor_server::service::orchestrator::Orchestrator;
use appvisor_server::{Config, Supervisor};
use tempfile::TempDir;

/// Temporary home for one scenario
pub struct TestEnv {
    root: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let root = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir_all(root.path().join("apps")).expect("Failed to create apps dir");
        Self { root }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn apps_dir(&self) -> PathBuf {
        self.root.path().join("apps")
    }

    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.root.path().join("state.db").display())
    }

    /// Create `apps/<dir>` with a manifest and extra files. Files under
    /// `scripts/` are made executable.
    pub fn add_app(&self, dir: &str, manifest: &str, files: &[(&str, &str)]) -> PathBuf {
        let app_dir = self.apps_dir().join(dir);
        fs::create_dir_all(&app_dir).expect("Failed to create app dir");
        fs::write(app_dir.join("manifest.toml"), manifest).expect("Failed to write manifest");

        for (rel, content) in files {
            let path = app_dir.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).expect("Failed to create parent dir");
            }
            fs::write(&path, content).expect("Failed to write app file");
            if rel.starts_with("scripts/") {
                fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
                    .expect("Failed to chmod script");
            }
        }
        app_dir
    }

    /// Write a services declaration file and return its path
    pub fn services_file(&self, content: &str) -> PathBuf {
        let path = self.root.path().join("services.toml");
        fs::write(&path, content).expect("Failed to write services file");
        path
    }

    pub fn config(&self) -> Config {
        Config {
            apps_dir: self.apps_dir(),
            database_url: self.database_url(),
            compose_file: self.root.path().join("docker-compose.yml"),
            script_timeout: 5,
            restart_settle_ms: 10,
            ..Config::default()
        }
    }

    /// Supervisor without container or compose runtime
    pub async fn supervisor(&self, config: Config) -> Supervisor {
        let pool = ServiceStateRepository::init(&config.database_url)
            .await
            .expect("Failed to open state database");
        let orchestrator = Orchestrator::unavailable(&config.compose_file);
        Supervisor::build(
            config,
            Some(ServiceStateRepository::new(pool)),
            None,
            orchestrator,
        )
        .await
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Manifest of the weather app used across scenarios
pub const WEATHER_MANIFEST: &str = r#"
[app]
id = "weather"
name = "Pogoda"
version = "1.2.0"

[commands]
pogoda = ["pogodę", "pogody", "prognoza"]

[scripts]
get_weather = "scripts/get_weather.sh"
slow = "scripts/slow.sh"

[error_handling]
on_timeout = "Serwis pogody nie odpowiada."
"#;

/// Prints a structured result for the city given as first argument
pub const WEATHER_SCRIPT: &str = r#"#!/bin/sh
printf '{"success": true, "city": "%s"}\n' "$1"
"#;

pub const SLOW_SCRIPT: &str = "#!/bin/sh\nsleep 30\n";

/// Every interface listed in /proc/net/dev output
pub fn interfaces(proc_net_dev: &str) -> Vec<String> {
    proc_net_dev
        .lines()
        .skip(2)
        .filter_map(|line| line.split(':').next())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect()
}
