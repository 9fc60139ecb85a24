//! App manifest domain model
//!
//! A manifest is decoded from `manifest.toml` into a closed set of typed
//! fields. Unknown tables are ignored; missing fields get explicit defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Manifest file name inside each app directory
pub const MANIFEST_FILE: &str = "manifest.toml";

/// Health of an app as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppStatus {
    Unknown,
    Healthy,
    Error,
}

impl AppStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Unknown => "unknown",
            AppStatus::Healthy => "healthy",
            AppStatus::Error => "error",
        }
    }
}

/// A registered command and the keywords that invoke it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub name: String,
    pub keywords: Vec<String>,
}

/// Parsed app manifest
#[derive(Debug, Clone, Serialize)]
pub struct AppManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub language: String,
    pub commands: Vec<CommandSpec>,
    /// Keyword groups from `[commands.keywords]`, flattened
    pub keywords: Vec<String>,
    /// Script name -> path relative to the app directory
    pub scripts: BTreeMap<String, String>,
    /// Failure class (`on_<class>`) -> user-facing message
    pub error_handling: BTreeMap<String, String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub path: PathBuf,
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RawManifest {
    #[serde(default)]
    app: RawAppSection,
    #[serde(default)]
    commands: toml::Table,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
    #[serde(default)]
    error_handling: BTreeMap<String, String>,
    #[serde(default)]
    ui: RawUiSection,
}

#[derive(Debug, Default, Deserialize)]
struct RawAppSection {
    id: Option<String>,
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUiSection {
    icon: Option<String>,
    color: Option<String>,
}

impl AppManifest {
    /// Decode a manifest. `app_dir` supplies the default id/name and the root
    /// every script path must stay inside.
    pub fn parse(content: &str, app_dir: &Path) -> Result<Self> {
        let manifest_path = app_dir.join(MANIFEST_FILE);
        let invalid = |reason: String| Error::InvalidManifest {
            path: manifest_path.display().to_string(),
            reason,
        };

        let raw: RawManifest = toml::from_str(content).map_err(|e| invalid(e.to_string()))?;

        let dir_name = app_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let id = raw.app.id.unwrap_or_else(|| dir_name.clone());
        if id.trim().is_empty() {
            return Err(invalid("app id is empty".to_string()));
        }

        let mut commands = Vec::new();
        let mut keywords = Vec::new();
        for (name, value) in raw.commands {
            if name == "keywords" {
                let groups = value
                    .as_table()
                    .ok_or_else(|| invalid("commands.keywords must be a table".to_string()))?;
                for (group, list) in groups {
                    keywords.extend(string_list(list).ok_or_else(|| {
                        invalid(format!("commands.keywords.{} must be a list of strings", group))
                    })?);
                }
                continue;
            }
            let list = string_list(&value).ok_or_else(|| {
                invalid(format!("commands.{} must be a list of strings", name))
            })?;
            commands.push(CommandSpec {
                name,
                keywords: list,
            });
        }

        for (script, rel) in &raw.scripts {
            if escapes_root(Path::new(rel)) {
                return Err(invalid(format!(
                    "script {} points outside the app directory: {}",
                    script, rel
                )));
            }
        }

        Ok(Self {
            id,
            name: raw.app.name.unwrap_or(dir_name),
            version: raw.app.version.unwrap_or_else(|| "1.0.0".to_string()),
            description: raw.app.description.unwrap_or_default(),
            language: raw.app.language.unwrap_or_else(|| "python".to_string()),
            commands,
            keywords,
            scripts: raw.scripts,
            error_handling: raw.error_handling,
            icon: raw.ui.icon,
            color: raw.ui.color,
            path: app_dir.to_path_buf(),
            enabled: true,
        })
    }

    /// Every phrase that should route to this app via containment
    pub fn all_keywords(&self) -> impl Iterator<Item = &str> {
        self.commands
            .iter()
            .flat_map(|c| c.keywords.iter())
            .chain(self.keywords.iter())
            .map(String::as_str)
    }

    /// Configured message for a failure class
    pub fn error_message(&self, failure_class: &str) -> Option<&str> {
        self.error_handling
            .get(&format!("on_{}", failure_class))
            .or_else(|| self.error_handling.get("fallback_response"))
            .map(String::as_str)
    }
}

fn string_list(value: &toml::Value) -> Option<Vec<String>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_str().map(str::to_string))
        .collect()
}

/// Lexical check: absolute paths and any `..` component leave the root
pub fn escapes_root(rel: &Path) -> bool {
    rel.components().any(|c| {
        matches!(
            c,
            std::path::Component::ParentDir
                | std::path::Component::RootDir
                | std::path::Component::Prefix(_)
        )
    })
}

/// Read `APP_ENABLED` from an app's `.env`, defaulting to enabled
pub fn read_enabled_flag(app_dir: &Path) -> bool {
    let env_file = app_dir.join(".env");
    let Ok(iter) = dotenvy::from_path_iter(&env_file) else {
        return true;
    };
    for item in iter.flatten() {
        if item.0 == "APP_ENABLED" {
            return matches!(item.1.trim().to_lowercase().as_str(), "true" | "1" | "yes");
        }
    }
    true
}
