//! Subprocess runner
//!
//! Every child is spawned as the leader of its own process group so that a
//! timeout can take down the whole tree, not only the direct child. Output is
//! drained concurrently from both pipes and capped per stream.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// How long pipe readers may lag behind process exit before being abandoned
const READER_GRACE: Duration = Duration::from_secs(2);

const READ_CHUNK: usize = 8192;

/// Environment the child starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvPolicy {
    /// Parent environment plus the extra variables
    Inherit,
    /// Only the extra variables
    Scoped,
}

/// Kernel-enforced limits applied in the child before exec
#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    /// RLIMIT_AS
    pub memory_bytes: Option<u64>,
    /// RLIMIT_CPU
    pub cpu_seconds: Option<u64>,
    /// RLIMIT_FSIZE
    pub max_file_bytes: Option<u64>,
    /// Move the child into fresh user + network namespaces (loopback only)
    pub isolate_network: bool,
}

/// What to run and under which constraints
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub env_policy: EnvPolicy,
    pub timeout: Duration,
    /// Per-stream capture cap
    pub max_output_bytes: usize,
    pub limits: Option<ResourceLimits>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: HashMap::new(),
            env_policy: EnvPolicy::Inherit,
            timeout,
            max_output_bytes: 1024 * 1024,
            limits: None,
        }
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }
}

/// Captured outcome of a process that was started
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Exit code; `128 + signal` for signal deaths
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Spawn the process, capture its output, and enforce the wall-clock timeout.
///
/// Returns `Err(SpawnFailed)` only when the process could not be started; a
/// process that ran and failed or timed out is reported through the output.
pub async fn run_process(spec: &ProcessSpec) -> Result<ProcessOutput> {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .process_group(0);

    if spec.env_policy == EnvPolicy::Scoped {
        cmd.env_clear();
    }
    cmd.envs(spec.env.iter());

    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }

    if let Some(limits) = spec.limits.clone() {
        // SAFETY: apply_limits only issues setrlimit/unshare syscalls and
        // allocates nothing, which is sound between fork and exec.
        unsafe {
            cmd.pre_exec(move || apply_limits(&limits));
        }
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("{}: {}", spec.program, e)))?;
    let pid = child.id();
    debug!(program = %spec.program, pid = ?pid, "Process spawned");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

    let cap = spec.max_output_bytes;
    let stdout_handle = tokio::spawn(read_bounded(stdout, cap));
    let stderr_handle = tokio::spawn(read_bounded(stderr, cap));

    let (exit_code, timed_out) = match tokio::time::timeout(spec.timeout, child.wait()).await {
        Ok(Ok(status)) => (
            status.code().or_else(|| status.signal().map(|s| 128 + s)),
            false,
        ),
        Ok(Err(e)) => {
            warn!(program = %spec.program, "Failed to wait for process: {}", e);
            kill_group(pid);
            (None, false)
        }
        Err(_) => {
            warn!(
                program = %spec.program,
                timeout_secs = spec.timeout.as_secs_f64(),
                "Process timed out, killing process group"
            );
            kill_group(pid);
            let _ = child.kill().await;
            (None, true)
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle, pid).await;
    let (stderr, stderr_truncated) = join_reader(stderr_handle, pid).await;

    Ok(ProcessOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout).to_string(),
        stderr: String::from_utf8_lossy(&stderr).to_string(),
        timed_out,
        truncated: stdout_truncated || stderr_truncated,
        duration: started.elapsed(),
    })
}

/// SIGKILL the process group led by `pid`
pub fn kill_group(pid: Option<u32>) {
    let Some(pid) = pid else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        // ESRCH: the group is already gone
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, "Failed to kill process group: {}", e);
        }
    }
}

/// Wait for a pipe reader. A background grandchild can keep the pipe open
/// after the leader exits; past the grace period the group is killed.
async fn join_reader(handle: JoinHandle<(Vec<u8>, bool)>, pid: Option<u32>) -> (Vec<u8>, bool) {
    let abort = handle.abort_handle();
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(_)) => (Vec::new(), false),
        Err(_) => {
            kill_group(pid);
            abort.abort();
            (Vec::new(), true)
        }
    }
}

/// Read to EOF, keeping at most `cap` bytes. Excess is drained and dropped so
/// the child never blocks on a full pipe.
async fn read_bounded<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> (Vec<u8>, bool) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut truncated = false;
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(buf.len());
                if n > room {
                    truncated = true;
                }
                buf.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (buf, truncated)
}

fn apply_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::libc::rlim_t;
    use nix::sys::resource::{setrlimit, Resource};

    if let Some(bytes) = limits.memory_bytes {
        setrlimit(Resource::RLIMIT_AS, bytes as rlim_t, bytes as rlim_t)?;
    }
    if let Some(secs) = limits.cpu_seconds {
        setrlimit(Resource::RLIMIT_CPU, secs as rlim_t, secs as rlim_t)?;
    }
    if let Some(bytes) = limits.max_file_bytes {
        setrlimit(Resource::RLIMIT_FSIZE, bytes as rlim_t, bytes as rlim_t)?;
    }
    if limits.isolate_network {
        isolate_network()?;
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn isolate_network() -> std::io::Result<()> {
    use nix::sched::{unshare, CloneFlags};

    unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNET)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn isolate_network() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "network namespaces are not available on this platform",
    ))
}
