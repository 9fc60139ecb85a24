//! Per-app log sinks
//!
//! Each app writes into its own `logs/` directory: readable lines
//! (`app.<date>.log`), errors only (`errors.<date>.log`) and one JSON entry
//! per line (`app.<date>.jsonl`). Files roll over daily and only the newest
//! [`MAX_LOG_FILES`] of each kind are kept. Every entry is mirrored to
//! `tracing` with the app id as a field.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;

/// Log directory name inside an app
pub const LOG_DIR: &str = "logs";

/// Rotated files kept per log kind
pub const MAX_LOG_FILES: usize = 7;

/// Upper bound on bytes read back when tailing one file
const MAX_TAIL_BYTES: u64 = 1024 * 1024;
const TAIL_CHUNK: u64 = 8 * 1024;

/// Kinds of log file in an app's log directory, as (prefix, suffix)
const TEXT_LOG: (&str, &str) = ("app", "log");
const ERROR_LOG: (&str, &str) = ("errors", "log");
const JSON_LOG: (&str, &str) = ("app", "jsonl");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }
}

/// One structured log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub app: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl LogEntry {
    fn new(app: &str, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            app: app.to_string(),
            level,
            message: message.into(),
            kind: None,
            script: None,
            duration_ms: None,
            success: None,
            error_type: None,
            details: None,
        }
    }

    fn text_line(&self) -> String {
        format!(
            "{} - {} - {} - {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.app,
            self.level.as_str(),
            self.message
        )
    }
}

/// Isolated log sink of one app
pub struct AppLogSink {
    app_id: String,
    dir: PathBuf,
    text: RollingFileAppender,
    errors: RollingFileAppender,
    json: RollingFileAppender,
    write_lock: Mutex<()>,
}

impl fmt::Debug for AppLogSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppLogSink")
            .field("app_id", &self.app_id)
            .field("dir", &self.dir)
            .finish()
    }
}

impl AppLogSink {
    /// Create the sink, making `<app_dir>/logs` if needed
    pub fn new(app_id: &str, app_dir: &Path) -> io::Result<Self> {
        let dir = app_dir.join(LOG_DIR);
        fs::create_dir_all(&dir)?;
        Ok(Self {
            app_id: app_id.to_string(),
            text: rolling_appender(&dir, TEXT_LOG)?,
            errors: rolling_appender(&dir, ERROR_LOG)?,
            json: rolling_appender(&dir, JSON_LOG)?,
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn info(&self, message: impl Into<String>) {
        self.write(LogEntry::new(&self.app_id, LogLevel::Info, message));
    }

    /// Record a script or build-target run
    pub fn log_script(
        &self,
        script: &str,
        duration_ms: u64,
        success: bool,
        error: Option<&str>,
    ) {
        let level = if success {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        let message = match error {
            Some(err) if !success => format!("Script {} failed after {}ms: {}", script, duration_ms, err),
            _ if success => format!("Script {} completed in {}ms", script, duration_ms),
            _ => format!("Script {} failed after {}ms", script, duration_ms),
        };
        let mut entry = LogEntry::new(&self.app_id, level, message);
        entry.kind = Some("script".to_string());
        entry.script = Some(script.to_string());
        entry.duration_ms = Some(duration_ms);
        entry.success = Some(success);
        self.write(entry);
    }

    /// Record an error with a type tag and optional context
    pub fn log_error(&self, error_type: &str, message: impl Into<String>, details: Option<Value>) {
        let mut entry = LogEntry::new(&self.app_id, LogLevel::Error, message);
        entry.kind = Some("error".to_string());
        entry.error_type = Some(error_type.to_string());
        entry.details = details;
        self.write(entry);
    }

    /// Record a routed command
    pub fn log_command(&self, command: &str, success: bool) {
        let mut entry = LogEntry::new(
            &self.app_id,
            LogLevel::Info,
            format!("Command: {}", command),
        );
        entry.kind = Some("command".to_string());
        entry.success = Some(success);
        self.write(entry);
    }

    /// Last `n` lines of the readable log, across rotated files
    pub fn recent_logs(&self, n: usize) -> Vec<String> {
        tail_lines(&self.dir, TEXT_LOG, n)
    }

    /// Last `n` lines of the error log
    pub fn recent_errors(&self, n: usize) -> Vec<String> {
        tail_lines(&self.dir, ERROR_LOG, n)
    }

    /// Last `n` parseable structured entries
    pub fn structured_logs(&self, n: usize) -> Vec<LogEntry> {
        tail_lines(&self.dir, JSON_LOG, n)
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn write(&self, entry: LogEntry) {
        match entry.level {
            LogLevel::Info => info!(app = %self.app_id, "{}", entry.message),
            LogLevel::Warning => warn!(app = %self.app_id, "{}", entry.message),
            LogLevel::Error => error!(app = %self.app_id, "{}", entry.message),
        }

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let line = entry.text_line();
        if let Err(e) = append_line(&self.text, &line) {
            warn!(app = %self.app_id, "Failed to write app log: {}", e);
        }
        if entry.level == LogLevel::Error {
            if let Err(e) = append_line(&self.errors, &line) {
                warn!(app = %self.app_id, "Failed to write error log: {}", e);
            }
        }
        match serde_json::to_string(&entry) {
            Ok(json) => {
                if let Err(e) = append_line(&self.json, &json) {
                    warn!(app = %self.app_id, "Failed to write structured log: {}", e);
                }
            }
            Err(e) => warn!(app = %self.app_id, "Failed to encode log entry: {}", e),
        }
    }
}

fn rolling_appender(dir: &Path, (prefix, suffix): (&str, &str)) -> io::Result<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix(suffix)
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .map_err(io::Error::other)
}

fn append_line(appender: &RollingFileAppender, line: &str) -> io::Result<()> {
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    appender.make_writer().write_all(record.as_bytes())
}

/// Files of one log kind, oldest first
fn rotated_files(dir: &Path, (prefix, suffix): (&str, &str)) -> Vec<PathBuf> {
    let head = format!("{}.", prefix);
    let tail = format!(".{}", suffix);
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&head) && name.ends_with(&tail))
        })
        .collect();
    // date-stamped names sort chronologically
    files.sort();
    files
}

/// Last `n` lines of one log kind, reading newest files first
fn tail_lines(dir: &Path, kind: (&str, &str), n: usize) -> Vec<String> {
    let mut collected: Vec<String> = Vec::new();
    for path in rotated_files(dir, kind).into_iter().rev() {
        if collected.len() >= n {
            break;
        }
        match read_tail(&path, n - collected.len()) {
            Ok(mut lines) => {
                lines.append(&mut collected);
                collected = lines;
            }
            Err(e) => warn!(path = %path.display(), "Failed to read log: {}", e),
        }
    }
    collected
}

/// Last `n` lines of a file, reading backwards in chunks from the end
fn read_tail(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let floor = len.saturating_sub(MAX_TAIL_BYTES);

    let mut pos = len;
    let mut buf: Vec<u8> = Vec::new();
    while pos > floor && buf.iter().filter(|b| **b == b'\n').count() <= n {
        let step = TAIL_CHUNK.min(pos - floor);
        pos -= step;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.lines().collect();
    // the first line is cut when reading stopped mid-file
    if pos > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}
