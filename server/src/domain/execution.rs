//! Execution result model

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

/// Why a run did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// The process ran and exited non-zero (or reported `success: false`)
    Domain,
    /// The process could not be started at all
    Infra,
    /// The process was killed after its wall-clock budget expired
    Timeout,
}

/// Captured stdout, decoded best-effort.
///
/// A single JSON value on stdout is exposed as structured data; anything else
/// is wrapped as `{"raw": text}`. This is a weak contract with the subprocess.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecOutput {
    Raw { raw: String },
    Structured(Value),
}

impl ExecOutput {
    pub fn raw(text: impl Into<String>) -> Self {
        ExecOutput::Raw { raw: text.into() }
    }

    pub fn as_structured(&self) -> Option<&Value> {
        match self {
            ExecOutput::Structured(v) => Some(v),
            ExecOutput::Raw { .. } => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            ExecOutput::Structured(_) => None,
            ExecOutput::Raw { raw } => Some(raw),
        }
    }
}

impl Default for ExecOutput {
    fn default() -> Self {
        ExecOutput::raw("")
    }
}

/// Outcome of running a script, build target or sandboxed command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: ExecOutput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    /// Output exceeded the capture cap and was cut
    pub truncated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Result for a process that never started
    pub fn infra_failure(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            failure: Some(FailureClass::Infra),
            error: Some(error.into()),
            duration_ms,
            ..Default::default()
        }
    }

    /// Decode stdout into structured output.
    ///
    /// An object with a boolean `success` field folds that flag into the
    /// result and drops it from the data; a string `error` field on such an
    /// object becomes the result error.
    pub fn decode_stdout(stdout: &str) -> (ExecOutput, Option<bool>, Option<String>) {
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return (ExecOutput::raw(""), None, None);
        }

        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(mut map)) => {
                let reported = match map.get("success") {
                    Some(Value::Bool(b)) => Some(*b),
                    _ => None,
                };
                let mut error = None;
                if reported.is_some() {
                    map.remove("success");
                    if let Some(Value::String(msg)) = map.get("error") {
                        error = Some(msg.clone());
                    }
                }
                (ExecOutput::Structured(Value::Object(map)), reported, error)
            }
            Ok(other) => (ExecOutput::Structured(other), None, None),
            Err(_) => (ExecOutput::raw(trimmed), None, None),
        }
    }

    /// The error this result stands for, if it failed
    pub fn to_error(&self) -> Option<Error> {
        if self.success {
            return None;
        }
        let message = self
            .error
            .clone()
            .unwrap_or_else(|| "execution failed".to_string());
        Some(match self.failure {
            Some(FailureClass::Timeout) => Error::ProcessTimeout(self.duration_ms / 1000),
            Some(FailureClass::Infra) => Error::SpawnFailed(message),
            _ => Error::ProcessExecutionFailed(message),
        })
    }
}
