//! Manifest registry
//!
//! Owns every [`AppManifest`]. Lookup tables are immutable snapshots behind an
//! `Arc`; `scan` and `reload` build a new snapshot and swap it in, so readers
//! never observe a half-built table.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::execution::ExecutionResult;
use crate::domain::manifest::{escapes_root, read_enabled_flag, AppManifest, AppStatus, MANIFEST_FILE};
use crate::error::{Error, Result};
use crate::infra::app_log::AppLogSink;
use crate::service::executor::ExecutionEngine;

const MAKEFILE: &str = "Makefile";
const DEFAULT_ICON: &str = "📦";
const DEFAULT_COLOR: &str = "#6366f1";

/// Mutable health bookkeeping of an app
#[derive(Debug, Clone)]
struct AppRuntime {
    status: AppStatus,
    last_error: Option<String>,
}

/// A registered app: immutable manifest plus its log sink
#[derive(Debug)]
pub struct AppEntry {
    manifest: AppManifest,
    logger: Arc<AppLogSink>,
    runtime: Mutex<AppRuntime>,
}

impl AppEntry {
    fn new(manifest: AppManifest, logger: Arc<AppLogSink>) -> Self {
        Self {
            manifest,
            logger,
            runtime: Mutex::new(AppRuntime {
                status: AppStatus::Unknown,
                last_error: None,
            }),
        }
    }

    pub fn manifest(&self) -> &AppManifest {
        &self.manifest
    }

    pub fn logger(&self) -> &AppLogSink {
        &self.logger
    }

    fn runtime(&self) -> AppRuntime {
        self.runtime
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_status(&self, status: AppStatus, last_error: Option<String>) {
        let mut runtime = self.runtime.lock().unwrap_or_else(|p| p.into_inner());
        runtime.status = status;
        runtime.last_error = last_error;
    }
}

/// One immutable generation of the lookup tables
#[derive(Debug, Default)]
struct Tables {
    /// Scan order; doubles as match priority
    apps: Vec<Arc<AppEntry>>,
    index: HashMap<String, usize>,
    /// Lowercased command literal -> app id, first registration wins
    commands: Vec<(String, String)>,
    /// Lowercased keyword -> app id, first registration wins
    keywords: Vec<(String, String)>,
}

impl Tables {
    fn build(apps: Vec<Arc<AppEntry>>) -> Self {
        let mut index = HashMap::new();
        let mut commands: Vec<(String, String)> = Vec::new();
        let mut keywords: Vec<(String, String)> = Vec::new();

        for (i, entry) in apps.iter().enumerate() {
            let manifest = &entry.manifest;
            index.insert(manifest.id.clone(), i);
            if !manifest.enabled {
                continue;
            }
            for command in &manifest.commands {
                let literal = command.name.trim().to_lowercase();
                if !literal.is_empty() && !commands.iter().any(|(c, _)| *c == literal) {
                    commands.push((literal, manifest.id.clone()));
                }
            }
            for keyword in manifest.all_keywords() {
                let keyword = keyword.trim().to_lowercase();
                if !keyword.is_empty() && !keywords.iter().any(|(k, _)| *k == keyword) {
                    keywords.push((keyword, manifest.id.clone()));
                }
            }
        }

        Self {
            apps,
            index,
            commands,
            keywords,
        }
    }

    fn get(&self, app_id: &str) -> Option<&Arc<AppEntry>> {
        self.index.get(app_id).and_then(|i| self.apps.get(*i))
    }
}

/// Health check outcome
#[derive(Debug, Clone, Serialize)]
pub struct AppHealth {
    pub app_id: String,
    pub status: AppStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// File inside an app directory
#[derive(Debug, Clone, Serialize)]
pub struct AppFile {
    pub path: String,
    pub size: u64,
    pub extension: String,
}

/// Row for UI listings
#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
    pub id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub language: String,
    pub enabled: bool,
    pub status: AppStatus,
    pub commands_count: usize,
    pub icon: String,
    pub color: String,
}

/// Recent log view of an app
#[derive(Debug, Clone, Serialize)]
pub struct AppLogs {
    pub app: String,
    pub logs: Vec<String>,
    pub errors: Vec<String>,
    pub logs_dir: PathBuf,
}

/// Everything needed to diagnose or repair an app
#[derive(Debug, Clone, Serialize)]
pub struct AppContext {
    pub app_id: String,
    pub name: String,
    pub version: String,
    pub language: String,
    pub status: AppStatus,
    pub last_error: Option<String>,
    pub path: PathBuf,
    pub files: Vec<AppFile>,
    pub recent_logs: Vec<String>,
    pub recent_errors: Vec<String>,
    pub error_handling: BTreeMap<String, String>,
    pub scripts: BTreeMap<String, String>,
}

/// Registry of apps discovered under the apps directory
pub struct ManifestRegistry {
    apps_dir: PathBuf,
    engine: Arc<ExecutionEngine>,
    script_timeout: Duration,
    make_timeout: Duration,
    tables: RwLock<Arc<Tables>>,
    /// Serializes snapshot writers (scan, reload)
    writer: Mutex<()>,
}

impl ManifestRegistry {
    /// Create an empty registry; call [`scan`](Self::scan) to populate it
    pub fn new(config: &Config, engine: Arc<ExecutionEngine>) -> Self {
        Self {
            apps_dir: config.apps_dir.clone(),
            engine,
            script_timeout: config.script_timeout(),
            make_timeout: config.make_timeout(),
            tables: RwLock::new(Arc::new(Tables::default())),
            writer: Mutex::new(()),
        }
    }

    fn snapshot(&self) -> Arc<Tables> {
        self.tables
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn swap(&self, tables: Tables) {
        *self.tables.write().unwrap_or_else(|p| p.into_inner()) = Arc::new(tables);
    }

    fn entry(&self, app_id: &str) -> Result<Arc<AppEntry>> {
        self.snapshot()
            .get(app_id)
            .cloned()
            .ok_or_else(|| Error::AppNotFound(app_id.to_string()))
    }

    fn enabled_entry(&self, app_id: &str) -> Result<Arc<AppEntry>> {
        let entry = self.entry(app_id)?;
        if !entry.manifest.enabled {
            return Err(Error::AppDisabled(app_id.to_string()));
        }
        Ok(entry)
    }

    /// Scan the apps directory and replace the registry contents.
    ///
    /// Returns the ids that loaded. A broken app is logged and skipped.
    pub fn scan(&self) -> Vec<String> {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());

        let mut dirs = match std::fs::read_dir(&self.apps_dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect::<Vec<_>>(),
            Err(e) => {
                warn!(apps_dir = %self.apps_dir.display(), "Apps directory unreadable: {}", e);
                if let Err(e) = std::fs::create_dir_all(&self.apps_dir) {
                    warn!("Failed to create apps directory: {}", e);
                }
                Vec::new()
            }
        };
        dirs.sort();

        let mut apps: Vec<Arc<AppEntry>> = Vec::new();
        for dir in dirs {
            if !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }
            match load_app(&dir) {
                Ok(entry) => {
                    let id = entry.manifest.id.clone();
                    if apps.iter().any(|a| a.manifest.id == id) {
                        warn!(app = %id, path = %dir.display(), "Duplicate app id, skipping");
                        continue;
                    }
                    info!(app = %id, name = %entry.manifest.name, enabled = entry.manifest.enabled, "App loaded");
                    apps.push(Arc::new(entry));
                }
                Err(e) => {
                    error!(path = %dir.display(), "Failed to load app: {}", e);
                }
            }
        }

        let loaded: Vec<String> = apps.iter().map(|a| a.manifest.id.clone()).collect();
        info!(count = loaded.len(), apps = ?loaded, "Registry scan complete");
        self.swap(Tables::build(apps));
        loaded
    }

    /// Re-parse one app and swap it in. On failure the app stays registered
    /// but disabled, with the parse error as `last_error`.
    pub fn reload(&self, app_id: &str) -> Result<()> {
        let _writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());

        let current = self.snapshot();
        let Some(index) = current.index.get(app_id).copied() else {
            return Err(Error::AppNotFound(app_id.to_string()));
        };
        let old = &current.apps[index];

        let replacement = match load_app(&old.manifest.path) {
            Ok(entry) if entry.manifest.id == app_id => Ok(entry),
            Ok(entry) => Err(Error::InvalidManifest {
                path: old.manifest.path.join(MANIFEST_FILE).display().to_string(),
                reason: format!("app id changed from {} to {}", app_id, entry.manifest.id),
            }),
            Err(e) => Err(e),
        };

        let mut apps = current.apps.clone();
        let result = match replacement {
            Ok(entry) => {
                info!(app = %app_id, "App reloaded");
                entry.logger.info(format!("App reloaded: v{}", entry.manifest.version));
                apps[index] = Arc::new(entry);
                Ok(())
            }
            Err(e) => {
                error!(app = %app_id, "Failed to reload app: {}", e);
                old.logger.log_error("reload_failed", e.to_string(), None);
                let mut manifest = old.manifest.clone();
                manifest.enabled = false;
                let disabled = AppEntry::new(manifest, old.logger.clone());
                disabled.set_status(AppStatus::Error, Some(e.to_string()));
                apps[index] = Arc::new(disabled);
                Err(e)
            }
        };

        self.swap(Tables::build(apps));
        result
    }

    /// Map free text onto the owning app: exact command literal, then
    /// command substring, then keyword substring. Scan order breaks ties.
    pub fn resolve(&self, text: &str) -> Option<String> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return None;
        }
        let tables = self.snapshot();

        tables
            .commands
            .iter()
            .find(|(literal, _)| *literal == needle)
            .or_else(|| {
                tables
                    .commands
                    .iter()
                    .find(|(literal, _)| needle.contains(literal.as_str()))
            })
            .or_else(|| {
                tables
                    .keywords
                    .iter()
                    .find(|(keyword, _)| needle.contains(keyword.as_str()))
            })
            .map(|(_, app_id)| app_id.clone())
    }

    pub fn get(&self, app_id: &str) -> Option<AppManifest> {
        self.snapshot().get(app_id).map(|e| e.manifest.clone())
    }

    /// Run a named script of an app
    pub async fn run_script(&self, app_id: &str, script: &str, args: &[String]) -> Result<ExecutionResult> {
        let entry = self.enabled_entry(app_id)?;
        let manifest = &entry.manifest;

        let Some(rel) = manifest.scripts.get(script) else {
            entry
                .logger
                .log_error("script_not_found", format!("Script not found: {}", script), None);
            return Err(Error::ScriptNotFound(format!("{}/{}", app_id, script)));
        };

        let path = match resolve_existing(&manifest.path, Path::new(rel)) {
            Ok(path) => path,
            Err(e) => {
                let error_type = match e {
                    Error::PathNotAllowed(_) => "path_not_allowed",
                    _ => "file_not_found",
                };
                entry.logger.log_error(error_type, e.to_string(), None);
                return Err(e);
            }
        };

        let (program, mut argv) = interpreter_for(&path);
        argv.extend(args.iter().cloned());

        let result = self
            .engine
            .run(&program, &argv, &manifest.path, self.script_timeout)
            .await;

        self.record_run(&entry, script, &result);
        Ok(result)
    }

    /// Run a build target from the app's Makefile
    pub async fn run_make(&self, app_id: &str, target: &str, vars: &[(String, String)]) -> Result<ExecutionResult> {
        let entry = self.enabled_entry(app_id)?;
        let manifest = &entry.manifest;

        if target.is_empty() || target.starts_with('-') {
            return Err(Error::InvalidParameter(format!("invalid make target: {:?}", target)));
        }
        if !manifest.path.join(MAKEFILE).is_file() {
            entry
                .logger
                .log_error("makefile_not_found", "Makefile not found", None);
            return Err(Error::FileNotFound(format!("{}/{}", app_id, MAKEFILE)));
        }

        let mut argv = vec![
            "-C".to_string(),
            manifest.path.display().to_string(),
            target.to_string(),
        ];
        for (key, value) in vars {
            argv.push(format!("{}={}", key.to_uppercase(), value));
        }

        let result = self
            .engine
            .run("make", &argv, &manifest.path, self.make_timeout)
            .await;

        self.record_run(&entry, &format!("make:{}", target), &result);
        Ok(result)
    }

    fn record_run(&self, entry: &AppEntry, name: &str, result: &ExecutionResult) {
        entry
            .logger
            .log_script(name, result.duration_ms, result.success, result.error.as_deref());
        if result.success {
            return;
        }
        if result.timed_out {
            entry
                .logger
                .log_error("timeout", format!("Timed out: {}", name), None);
        } else if let Some(stderr) = &result.stderr {
            let excerpt: String = stderr.chars().take(500).collect();
            entry.logger.log_error("script_error", excerpt, None);
        } else if let Some(err) = &result.error {
            entry.logger.log_error("exception", err.clone(), None);
        }
    }

    /// Read a file inside the app directory
    pub async fn read_file(&self, app_id: &str, rel: &str) -> Result<String> {
        let entry = self.entry(app_id)?;
        let path = resolve_existing(&entry.manifest.path, Path::new(rel)).map_err(|e| {
            if let Error::PathNotAllowed(_) = e {
                warn!(app = %app_id, path = %rel, "Rejected read outside app directory");
            }
            e
        })?;
        if !path.is_file() {
            return Err(Error::FileNotFound(format!("{}/{}", app_id, rel)));
        }
        Ok(tokio::fs::read_to_string(&path).await?)
    }

    /// Write a file inside the app directory, creating parent directories
    pub async fn write_file(&self, app_id: &str, rel: &str, content: &str) -> Result<()> {
        let entry = self.entry(app_id)?;
        let path = resolve_for_write(&entry.manifest.path, Path::new(rel)).map_err(|e| {
            if let Error::PathNotAllowed(_) = e {
                warn!(app = %app_id, path = %rel, "Rejected write outside app directory");
            }
            e
        })?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, content).await?;
        info!(app = %app_id, path = %rel, "File written");
        Ok(())
    }

    /// Run the `health` build target and record the result
    pub async fn check_health(&self, app_id: &str) -> Result<AppHealth> {
        let entry = self.entry(app_id)?;
        let outcome = self.run_make(app_id, "health", &[]).await;

        let health = match outcome {
            Ok(result) if result.success => {
                entry.set_status(AppStatus::Healthy, None);
                AppHealth {
                    app_id: app_id.to_string(),
                    status: AppStatus::Healthy,
                    output: Some(result),
                    error: None,
                }
            }
            Ok(result) => {
                let error = result
                    .error
                    .clone()
                    .or_else(|| result.stderr.clone())
                    .unwrap_or_else(|| "health check failed".to_string());
                entry.set_status(AppStatus::Error, Some(error.clone()));
                AppHealth {
                    app_id: app_id.to_string(),
                    status: AppStatus::Error,
                    output: Some(result),
                    error: Some(error),
                }
            }
            Err(e) => {
                entry.set_status(AppStatus::Error, Some(e.to_string()));
                AppHealth {
                    app_id: app_id.to_string(),
                    status: AppStatus::Error,
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        };
        Ok(health)
    }

    /// User-facing message for a failure class
    pub fn error_response(&self, app_id: &str, failure_class: &str) -> String {
        match self.snapshot().get(app_id) {
            Some(entry) => entry
                .manifest
                .error_message(failure_class)
                .unwrap_or("An error occurred.")
                .to_string(),
            None => "Application error.".to_string(),
        }
    }

    /// Non-hidden files of an app, relative to its directory
    pub fn list_files(&self, app_id: &str) -> Result<Vec<AppFile>> {
        let entry = self.entry(app_id)?;
        let root = &entry.manifest.path;
        let mut files = Vec::new();
        collect_files(root, root, &mut files)?;
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    pub fn summaries(&self) -> Vec<AppSummary> {
        self.snapshot()
            .apps
            .iter()
            .map(|entry| {
                let m = &entry.manifest;
                AppSummary {
                    id: m.id.clone(),
                    name: m.name.clone(),
                    version: m.version.clone(),
                    description: m.description.clone(),
                    language: m.language.clone(),
                    enabled: m.enabled,
                    status: entry.runtime().status,
                    commands_count: m.commands.len(),
                    icon: m.icon.clone().unwrap_or_else(|| DEFAULT_ICON.to_string()),
                    color: m.color.clone().unwrap_or_else(|| DEFAULT_COLOR.to_string()),
                }
            })
            .collect()
    }

    pub fn app_logs(&self, app_id: &str, lines: usize) -> Result<AppLogs> {
        let entry = self.entry(app_id)?;
        Ok(AppLogs {
            app: app_id.to_string(),
            logs: entry.logger.recent_logs(lines),
            errors: entry.logger.recent_errors(lines / 2),
            logs_dir: entry.logger.dir().to_path_buf(),
        })
    }

    /// Record a routed command in the app's log
    pub fn log_command(&self, app_id: &str, command: &str, success: bool) {
        if let Some(entry) = self.snapshot().get(app_id) {
            entry.logger.log_command(command, success);
        }
    }

    pub fn context(&self, app_id: &str) -> Result<AppContext> {
        let entry = self.entry(app_id)?;
        let m = &entry.manifest;
        let runtime = entry.runtime();
        Ok(AppContext {
            app_id: m.id.clone(),
            name: m.name.clone(),
            version: m.version.clone(),
            language: m.language.clone(),
            status: runtime.status,
            last_error: runtime.last_error,
            path: m.path.clone(),
            files: self.list_files(app_id)?,
            recent_logs: entry.logger.recent_logs(30),
            recent_errors: entry.logger.recent_errors(10),
            error_handling: m.error_handling.clone(),
            scripts: m.scripts.clone(),
        })
    }

    /// Status and last error of an app
    pub fn status(&self, app_id: &str) -> Result<(AppStatus, Option<String>)> {
        let runtime = self.entry(app_id)?.runtime();
        Ok((runtime.status, runtime.last_error))
    }
}

fn load_app(dir: &Path) -> Result<AppEntry> {
    let manifest_path = dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path).map_err(|e| Error::InvalidManifest {
        path: manifest_path.display().to_string(),
        reason: e.to_string(),
    })?;
    let mut manifest = AppManifest::parse(&content, dir)?;
    manifest.enabled = read_enabled_flag(dir);

    let logger = AppLogSink::new(&manifest.id, dir)?;
    logger.info(format!("App loaded: {} v{}", manifest.id, manifest.version));
    Ok(AppEntry::new(manifest, Arc::new(logger)))
}

/// Interpreter and leading args for a script, chosen by extension
fn interpreter_for(path: &Path) -> (String, Vec<String>) {
    let script = path.display().to_string();
    match path.extension().and_then(|e| e.to_str()) {
        Some("py") => ("python3".to_string(), vec![script]),
        Some("sh") => ("sh".to_string(), vec![script]),
        _ => (script, Vec::new()),
    }
}

/// Resolve an existing path strictly inside `root`, following symlinks
fn resolve_existing(root: &Path, rel: &Path) -> Result<PathBuf> {
    reject_lexical_escape(rel)?;
    let root = root.canonicalize()?;
    let candidate = root.join(rel);
    let resolved = candidate
        .canonicalize()
        .map_err(|_| Error::FileNotFound(rel.display().to_string()))?;
    if !resolved.starts_with(&root) {
        return Err(Error::PathNotAllowed(rel.display().to_string()));
    }
    Ok(resolved)
}

/// Resolve a write target inside `root`. The deepest existing ancestor (and
/// the target itself, if present) must resolve inside the root.
fn resolve_for_write(root: &Path, rel: &Path) -> Result<PathBuf> {
    reject_lexical_escape(rel)?;
    let root = root.canonicalize()?;
    let candidate = root.join(rel);

    if candidate.exists() {
        let resolved = candidate.canonicalize()?;
        if !resolved.starts_with(&root) || resolved == root {
            return Err(Error::PathNotAllowed(rel.display().to_string()));
        }
        return Ok(resolved);
    }

    let mut ancestor = candidate.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let resolved = dir.canonicalize()?;
            if !resolved.starts_with(&root) {
                return Err(Error::PathNotAllowed(rel.display().to_string()));
            }
            break;
        }
        ancestor = dir.parent();
    }
    Ok(candidate)
}

fn reject_lexical_escape(rel: &Path) -> Result<()> {
    if rel.as_os_str().is_empty() || escapes_root(rel) {
        return Err(Error::PathNotAllowed(rel.display().to_string()));
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<AppFile>) -> Result<()> {
    for item in std::fs::read_dir(dir)? {
        let item = item?;
        let name = item.file_name();
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        let path = item.path();
        let file_type = item.file_type()?;
        if file_type.is_dir() {
            collect_files(root, &path, out)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).unwrap_or(&path);
            out.push(AppFile {
                path: rel.display().to_string(),
                size: item.metadata()?.len(),
                extension: path
                    .extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_default(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_app(root: &Path, dir: &str, manifest: &str) -> PathBuf {
        let app = root.join(dir);
        fs::create_dir_all(app.join("scripts")).unwrap();
        fs::write(app.join(MANIFEST_FILE), manifest).unwrap();
        app
    }

    fn registry(root: &Path) -> ManifestRegistry {
        let config = Config {
            apps_dir: root.to_path_buf(),
            script_timeout: 5,
            ..Default::default()
        };
        ManifestRegistry::new(&config, Arc::new(ExecutionEngine::new(64 * 1024)))
    }

    #[test]
    fn test_scan_skips_broken_manifest() {
        let root = tempfile::tempdir().unwrap();
        write_app(root.path(), "a_broken", "[app\nid = ");
        write_app(root.path(), "b_notes", "[app]\nid = \"notes\"\n");
        fs::create_dir_all(root.path().join("c_not_an_app")).unwrap();

        let reg = registry(root.path());
        assert_eq!(reg.scan(), vec!["notes".to_string()]);
        assert!(reg.get("notes").is_some());
    }

    #[test]
    fn test_resolve_precedence_and_scan_order() {
        let root = tempfile::tempdir().unwrap();
        write_app(
            root.path(),
            "a_weather",
            "[app]\nid = \"weather\"\n[commands]\npogoda = [\"pogodę\", \"prognoza\"]\n",
        );
        write_app(
            root.path(),
            "b_calendar",
            "[app]\nid = \"calendar\"\n[commands]\n\"pogoda jutro\" = []\nkalendarz = [\"prognoza\"]\n",
        );

        let reg = registry(root.path());
        reg.scan();
        // exact literal beats earlier substring matches
        assert_eq!(reg.resolve("Pogoda Jutro").as_deref(), Some("calendar"));
        assert_eq!(reg.resolve("jaka jest pogoda?").as_deref(), Some("weather"));
        assert_eq!(reg.resolve("pokaż mi dzisiaj pogodę").as_deref(), Some("weather"));
        // shared keyword: first scanned app wins
        assert_eq!(reg.resolve("prognoza").as_deref(), Some("weather"));
        assert_eq!(reg.resolve("coś zupełnie innego"), None);
    }

    #[test]
    fn test_disabled_app_is_not_resolved() {
        let root = tempfile::tempdir().unwrap();
        let app = write_app(
            root.path(),
            "cams",
            "[app]\nid = \"cams\"\n[commands]\nkamera = []\n",
        );
        fs::write(app.join(".env"), "APP_ENABLED=false\n").unwrap();

        let reg = registry(root.path());
        reg.scan();
        assert_eq!(reg.resolve("kamera"), None);
        assert!(reg.summaries().iter().any(|s| s.id == "cams" && !s.enabled));
    }

    #[tokio::test]
    async fn test_path_containment() {
        let root = tempfile::tempdir().unwrap();
        write_app(root.path(), "notes", "[app]\nid = \"notes\"\n");
        fs::write(root.path().join("secret.txt"), "top secret").unwrap();

        let reg = registry(root.path());
        reg.scan();

        for bad in ["../secret.txt", "scripts/../../secret.txt", "/etc/passwd", ""] {
            assert!(matches!(
                reg.read_file("notes", bad).await,
                Err(Error::PathNotAllowed(_))
            ));
            assert!(matches!(
                reg.write_file("notes", bad, "x").await,
                Err(Error::PathNotAllowed(_))
            ));
        }
        assert!(!root.path().join("pwned").exists());

        reg.write_file("notes", "data/todo.txt", "milk").await.unwrap();
        assert_eq!(reg.read_file("notes", "data/todo.txt").await.unwrap(), "milk");
    }

    #[tokio::test]
    async fn test_symlink_escape_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs::write(outside.path().join("loot.txt"), "x").unwrap();
        let app = write_app(root.path(), "notes", "[app]\nid = \"notes\"\n");
        std::os::unix::fs::symlink(outside.path(), app.join("link")).unwrap();

        let reg = registry(root.path());
        reg.scan();
        assert!(matches!(
            reg.read_file("notes", "link/loot.txt").await,
            Err(Error::PathNotAllowed(_))
        ));
        assert!(matches!(
            reg.write_file("notes", "link/new.txt", "x").await,
            Err(Error::PathNotAllowed(_))
        ));
        assert!(!outside.path().join("new.txt").exists());
    }

    #[tokio::test]
    async fn test_run_script_missing_script_and_file() {
        let root = tempfile::tempdir().unwrap();
        write_app(
            root.path(),
            "notes",
            "[app]\nid = \"notes\"\n[scripts]\nghost = \"scripts/ghost.sh\"\n",
        );
        let reg = registry(root.path());
        reg.scan();

        assert!(matches!(
            reg.run_script("notes", "nope", &[]).await,
            Err(Error::ScriptNotFound(_))
        ));
        assert!(matches!(
            reg.run_script("notes", "ghost", &[]).await,
            Err(Error::FileNotFound(_))
        ));
        assert!(matches!(
            reg.run_script("nobody", "x", &[]).await,
            Err(Error::AppNotFound(_))
        ));
        assert!(!reg.app_logs("notes", 10).unwrap().errors.is_empty());
    }

    #[tokio::test]
    async fn test_run_script_logs_to_app_sink() {
        let root = tempfile::tempdir().unwrap();
        let app = write_app(
            root.path(),
            "echo",
            "[app]\nid = \"echo\"\n[scripts]\nsay = \"scripts/say.sh\"\n",
        );
        fs::write(app.join("scripts/say.sh"), "echo \"$1\"\n").unwrap();

        let reg = registry(root.path());
        reg.scan();
        let result = reg
            .run_script("echo", "say", &["hello".to_string()])
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.as_raw(), Some("hello"));

        let logs = reg.app_logs("echo", 50).unwrap();
        assert!(logs.logs.iter().any(|l| l.contains("Script say completed")));
    }

    #[test]
    fn test_reload_failure_disables_only_that_app() {
        let root = tempfile::tempdir().unwrap();
        let a = write_app(
            root.path(),
            "a",
            "[app]\nid = \"a\"\n[commands]\nalpha = []\n",
        );
        write_app(root.path(), "b", "[app]\nid = \"b\"\n[commands]\nbeta = []\n");

        let reg = registry(root.path());
        reg.scan();
        fs::write(a.join(MANIFEST_FILE), "[commands]\nalpha = 3\n").unwrap();

        assert!(reg.reload("a").is_err());
        assert_eq!(reg.resolve("alpha"), None);
        assert_eq!(reg.resolve("beta").as_deref(), Some("b"));
        let (status, last_error) = reg.status("a").unwrap();
        assert_eq!(status, AppStatus::Error);
        assert!(last_error.is_some());

        fs::write(
            a.join(MANIFEST_FILE),
            "[app]\nid = \"a\"\n[commands]\nalpha = []\nomega = []\n",
        )
        .unwrap();
        reg.reload("a").unwrap();
        assert_eq!(reg.resolve("omega").as_deref(), Some("a"));
    }

    #[test]
    fn test_error_response_fallbacks() {
        let root = tempfile::tempdir().unwrap();
        write_app(
            root.path(),
            "w",
            "[app]\nid = \"w\"\n[error_handling]\non_timeout = \"Too slow\"\n",
        );
        let reg = registry(root.path());
        reg.scan();
        assert_eq!(reg.error_response("w", "timeout"), "Too slow");
        assert_eq!(reg.error_response("w", "domain"), "An error occurred.");
        assert_eq!(reg.error_response("missing", "timeout"), "Application error.");
    }

    #[test]
    fn test_list_files_skips_hidden() {
        let root = tempfile::tempdir().unwrap();
        let app = write_app(root.path(), "notes", "[app]\nid = \"notes\"\n");
        fs::write(app.join(".env"), "APP_ENABLED=true\n").unwrap();
        fs::write(app.join("scripts/run.py"), "print(1)\n").unwrap();

        let reg = registry(root.path());
        reg.scan();
        let files = reg.list_files("notes").unwrap();
        let paths: Vec<&str> = files.iter().map(|f| f.path.as_str()).collect();
        assert!(paths.contains(&"manifest.toml"));
        assert!(paths.contains(&"scripts/run.py"));
        assert!(!paths.iter().any(|p| p.starts_with('.')));
    }
}
