//! Execution engine: run a subprocess and classify its outcome

use std::path::Path;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::domain::execution::{ExecutionResult, FailureClass};
use crate::infra::process::{run_process, ProcessOutput, ProcessSpec};

/// Executes subprocesses with bounded capture and a hard timeout
#[derive(Debug, Clone)]
pub struct ExecutionEngine {
    max_output_bytes: usize,
}

impl ExecutionEngine {
    pub fn new(max_output_bytes: usize) -> Self {
        Self { max_output_bytes }
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
    }

    /// Run `program args...` in `working_dir`, killing its process group
    /// after `timeout`
    pub async fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Path,
        timeout: Duration,
    ) -> ExecutionResult {
        let spec = ProcessSpec::new(program, args.to_vec(), timeout)
            .cwd(working_dir)
            .max_output_bytes(self.max_output_bytes);
        self.run_spec(&spec).await
    }

    /// Run a fully specified process
    pub async fn run_spec(&self, spec: &ProcessSpec) -> ExecutionResult {
        let started = Instant::now();
        debug!(program = %spec.program, args = ?spec.args, "Executing");

        match run_process(spec).await {
            Ok(out) => {
                let result = classify(out, spec.timeout);
                info!(
                    program = %spec.program,
                    success = result.success,
                    exit_code = ?result.exit_code,
                    duration_ms = result.duration_ms,
                    timed_out = result.timed_out,
                    "Execution finished"
                );
                result
            }
            Err(e) => {
                warn!(program = %spec.program, "Execution could not start: {}", e);
                ExecutionResult::infra_failure(e.to_string(), started.elapsed().as_millis() as u64)
            }
        }
    }
}

/// Turn captured process output into an [`ExecutionResult`]
pub fn classify(out: ProcessOutput, timeout: Duration) -> ExecutionResult {
    let duration_ms = out.duration.as_millis() as u64;
    let stderr = if out.stderr.trim().is_empty() {
        None
    } else {
        Some(out.stderr)
    };

    if out.timed_out {
        return ExecutionResult {
            success: false,
            output: crate::domain::execution::ExecOutput::raw(out.stdout.trim()),
            stderr,
            exit_code: None,
            duration_ms,
            timed_out: true,
            truncated: out.truncated,
            failure: Some(FailureClass::Timeout),
            error: Some(format!("Timed out after {}s", timeout.as_secs_f64())),
        };
    }

    let (output, reported, reported_error) = ExecutionResult::decode_stdout(&out.stdout);
    let exited_ok = out.exit_code == Some(0);
    let success = exited_ok && reported != Some(false);

    let error = if success {
        None
    } else {
        reported_error.or_else(|| match out.exit_code {
            Some(0) => Some("Process reported failure".to_string()),
            Some(code) => Some(format!("Process exited with code {}", code)),
            None => Some("Process exited without a status".to_string()),
        })
    };

    ExecutionResult {
        success,
        output,
        stderr,
        exit_code: out.exit_code,
        duration_ms,
        timed_out: false,
        truncated: out.truncated,
        failure: (!success).then_some(FailureClass::Domain),
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> ExecutionEngine {
        ExecutionEngine::new(64 * 1024)
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_structured_output_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine()
            .run(
                "sh",
                &sh(r#"echo '{"success": true, "city": "Kraków"}'"#),
                dir.path(),
                Duration::from_secs(5),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.output.as_structured(), Some(&json!({"city": "Kraków"})));
        assert!(result.failure.is_none());
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_domain_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine()
            .run("sh", &sh("echo oops >&2; exit 2"), dir.path(), Duration::from_secs(5))
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureClass::Domain));
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stderr.as_deref().map(str::trim), Some("oops"));
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn test_reported_failure_overrides_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine()
            .run(
                "sh",
                &sh(r#"echo '{"success": false, "error": "no such city"}'"#),
                dir.path(),
                Duration::from_secs(5),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("no such city"));
        assert_eq!(result.failure, Some(FailureClass::Domain));
    }

    #[tokio::test]
    async fn test_missing_executable_is_infra_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine()
            .run(
                "/definitely/not/here",
                &[],
                dir.path(),
                Duration::from_secs(5),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.failure, Some(FailureClass::Infra));
        assert!(result.exit_code.is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_distinguished() {
        let dir = tempfile::tempdir().unwrap();
        let result = engine()
            .run("sh", &sh("sleep 10"), dir.path(), Duration::from_millis(200))
            .await;
        assert!(result.timed_out);
        assert_eq!(result.failure, Some(FailureClass::Timeout));
        assert!(result.exit_code.is_none());
    }
}
