//! Subprocess execution with a hard wall-clock budget.
//!
//! Every compiler and checker invocation goes through [`run_command`]. The
//! child is placed in its own process group so that a timeout kills the
//! whole tree it spawned, not just the direct child.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{MemgateError, Result};

/// How long pipe readers may linger after the child has been reaped.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A fully specified external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    /// Executable, resolved through `PATH` when not a path.
    pub program: String,

    /// Arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: Vec<(String, String)>,

    /// Working directory; inherits the caller's when `None`.
    pub cwd: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Shell-like rendering for logs and reproduction hints.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1 + self.env.len());
        for (key, value) in &self.env {
            parts.push(format!("{key}={value}"));
        }
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

/// Result of a finished (or killed) subprocess.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,

    /// Terminating signal, if any.
    pub signal: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,

    /// Whether the budget was exceeded and the process group killed.
    pub timed_out: bool,
}

impl ProcessOutput {
    /// Exit code 0 within the budget.
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stdout followed by stderr, skipping empty streams.
    pub fn combined(&self) -> String {
        match (self.stdout.is_empty(), self.stderr.is_empty()) {
            (true, _) => self.stderr.clone(),
            (false, true) => self.stdout.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }
}

/// Run a command to completion or until `timeout` elapses.
///
/// Returns `Err` only when the process cannot be spawned; a non-zero exit,
/// a signal, or a timeout are all reported through [`ProcessOutput`].
pub async fn run_command(command: &CommandLine, timeout: Duration) -> Result<ProcessOutput> {
    if command.program.is_empty() {
        return Err(MemgateError::EmptyCommand(command.display()));
    }

    let start = Instant::now();

    let mut std_cmd = std::process::Command::new(&command.program);
    std_cmd
        .args(&command.args)
        .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = &command.cwd {
        std_cmd.current_dir(cwd);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| MemgateError::Spawn {
        program: command.program.clone(),
        source,
    })?;

    let stdout_task = tokio::spawn(read_pipe(child.stdout.take()));
    let stderr_task = tokio::spawn(read_pipe(child.stderr.take()));

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => (status.ok(), false),
        Err(_) => {
            warn!(
                program = %command.program,
                timeout_secs = timeout.as_secs(),
                "Process exceeded its time budget, killing process group"
            );
            (terminate(&mut child).await, true)
        }
    };

    let stdout = drain(stdout_task).await;
    let stderr = drain(stderr_task).await;
    let duration_ms = start.elapsed().as_millis() as u64;

    let (exit_code, signal) = status.map(decode_status).unwrap_or((None, None));
    debug!(
        program = %command.program,
        exit_code = ?exit_code,
        signal = ?signal,
        timed_out,
        duration_ms,
        "Process finished"
    );

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout,
        stderr,
        duration_ms,
        timed_out,
    })
}

/// Kill the child's process group (and the child) and reap it.
async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    #[cfg(unix)]
    {
        use rustix::process::{kill_process_group, Pid, Signal};

        let group = child
            .id()
            .and_then(|pid| i32::try_from(pid).ok())
            .and_then(Pid::from_raw);
        if let Some(group) = group {
            if let Err(e) = kill_process_group(group, Signal::Kill) {
                debug!(error = %e, "Process group already gone");
            }
        }
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Child already exited");
    }
    child.wait().await.ok()
}

async fn read_pipe<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        // A read error just truncates the capture.
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

async fn drain(task: tokio::task::JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        _ => String::new(),
    }
}

#[cfg(unix)]
fn decode_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    use std::os::unix::process::ExitStatusExt;
    (status.code(), status.signal())
}

#[cfg(not(unix))]
fn decode_status(status: ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), None)
}
