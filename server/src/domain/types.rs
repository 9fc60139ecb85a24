//! Common domain types

use serde::{Deserialize, Serialize};

/// Result of one external CLI invocation (compose runtime, health probe)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CommandResult {
    /// Error text for a failed invocation: stderr, else stdout, else the exit code
    pub fn error_text(&self) -> String {
        if self.timed_out {
            return "command timed out".to_string();
        }
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        format!("exit code {}", self.exit_code)
    }
}
