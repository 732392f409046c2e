//! # Process Runner Crate
//!
//! A single place to run the external tools this backend depends on.
//!
//! Every invocation goes through [`ProcessRunner::run`], which enforces:
//!
//! - an allow-list of executables, configured per runner instance
//! - argument vectors only, never shell interpretation
//! - a wall-clock timeout with SIGTERM → SIGKILL escalation against the
//!   child's process group
//! - cooperative cancellation via a [`CancellationToken`]
//! - bounded capture of stdout/stderr (1 MiB each, oldest bytes dropped)
//!
//! A finished call always yields a [`RunOutcome`] record; errors are reserved
//! for precondition violations such as an executable outside the allow-list.

mod capture;

pub use capture::CappedBuffer;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Cap for each captured output stream.
pub const OUTPUT_CAP_BYTES: usize = 1024 * 1024;

/// Grace period between soft termination and hard kill.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors for calls that could not produce an outcome record.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// `argv[0]` is not on this runner's allow-list.
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),

    /// Empty argument vector.
    #[error("empty argument vector")]
    EmptyArgv,

    /// The executable exists on the allow-list but could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// A request to execute one external command.
#[derive(Debug, Default)]
pub struct RunRequest {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl RunRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[must_use]
    pub fn stdin(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }
}

/// What happened when a command ran.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Exit code, `None` when the process died to a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub cancelled: bool,
    pub timed_out: bool,
}

impl RunOutcome {
    /// True when the process exited normally with status zero.
    #[must_use]
    pub fn success(&self) -> bool {
        !self.cancelled && !self.timed_out && self.exit_code == Some(0)
    }
}

/// Executes allow-listed commands.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    allowed: Vec<String>,
}

impl ProcessRunner {
    /// Creates a runner that may execute exactly the given programs.
    ///
    /// Entries may be bare names (`tectonic`) or absolute paths; `argv[0]`
    /// must match an entry verbatim.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    #[must_use]
    pub fn is_allowed(&self, program: &str) -> bool {
        self.allowed.iter().any(|a| a == program)
    }

    /// Runs a command to completion, timeout, or cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError`] only for precondition violations: an empty
    /// argv, a program outside the allow-list, or a spawn failure (missing
    /// executable). Every started process yields an `Ok(RunOutcome)`.
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, RunnerError> {
        let Some(program) = request.argv.first().cloned() else {
            return Err(RunnerError::EmptyArgv);
        };
        if !self.is_allowed(&program) {
            return Err(RunnerError::CommandNotAllowed(program));
        }

        debug!(command = %request.argv.join(" "), "running external command");

        let mut cmd = Command::new(&program);
        cmd.args(&request.argv[1..])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &request.env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            command: program.clone(),
            source,
        })?;

        if let Some(bytes) = request.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                // A child that exits early may close the pipe; not an error.
                let _ = stdin.write_all(&bytes).await;
                let _ = stdin.shutdown().await;
            }
        }

        let stdout_task = capture::drain(child.stdout.take());
        let stderr_task = capture::drain(child.stderr.take());

        let timeout = request.timeout.unwrap_or(Duration::from_secs(300));
        let cancel = request.cancel.unwrap_or_default();

        let mut timed_out = false;
        let mut cancelled = false;
        let status = match tokio::time::timeout(timeout, wait_or_cancel(&mut child, &cancel)).await
        {
            Ok(WaitEnd::Exited(status)) => status,
            Ok(WaitEnd::Cancelled) => {
                cancelled = true;
                terminate(&mut child, &program).await
            }
            Err(_) => {
                timed_out = true;
                terminate(&mut child, &program).await
            }
        };

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let outcome = RunOutcome {
            exit_code: status.and_then(|s| s.code()),
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            duration: started.elapsed(),
            cancelled,
            timed_out,
        };
        if timed_out {
            warn!(command = %program, elapsed = ?outcome.duration, "command timed out");
        }
        Ok(outcome)
    }
}

enum WaitEnd {
    Exited(Option<std::process::ExitStatus>),
    Cancelled,
}

/// Waits for exit or cancellation; the child borrow stays confined here so
/// the caller can still kill on the cancellation path.
async fn wait_or_cancel(child: &mut Child, cancel: &CancellationToken) -> WaitEnd {
    tokio::select! {
        status = child.wait() => WaitEnd::Exited(status.ok()),
        () = cancel.cancelled() => WaitEnd::Cancelled,
    }
}

/// Soft-terminates the child's process group, escalating to a hard kill
/// after [`KILL_GRACE`].
async fn terminate(child: &mut Child, program: &str) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned as its own process group leader, so the
        // signal reaches grandchildren too.
        unsafe {
            libc::killpg(pid as i32, libc::SIGTERM);
        }
        if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
            return status.ok();
        }
        warn!(command = %program, "process ignored SIGTERM, sending SIGKILL");
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = child.start_kill();
    child.wait().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh_runner() -> ProcessRunner {
        ProcessRunner::new(["/bin/sh", "/bin/echo"])
    }

    #[tokio::test]
    async fn rejects_commands_outside_allow_list() {
        let runner = sh_runner();
        let err = runner
            .run(RunRequest::new(["/bin/rm", "-rf", "/tmp/nope"]))
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::CommandNotAllowed(_)));
    }

    #[tokio::test]
    async fn rejects_empty_argv() {
        let runner = sh_runner();
        let err = runner.run(RunRequest::new(Vec::<String>::new())).await.unwrap_err();
        assert!(matches!(err, RunnerError::EmptyArgv));
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = sh_runner();
        let outcome = runner
            .run(RunRequest::new(["/bin/sh", "-c", "echo hello; exit 3"]))
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout.trim(), "hello");
        assert!(!outcome.timed_out);
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn timeout_is_reported_not_raised() {
        let runner = sh_runner();
        let outcome = runner
            .run(
                RunRequest::new(["/bin/sh", "-c", "sleep 30"])
                    .timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert!(outcome.timed_out);
        assert!(!outcome.success());
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let runner = sh_runner();
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let runner = runner.clone();
            let token = token.clone();
            async move {
                runner
                    .run(
                        RunRequest::new(["/bin/sh", "-c", "sleep 30"])
                            .timeout(Duration::from_secs(60))
                            .cancel(token),
                    )
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        let outcome = handle.await.unwrap().unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.duration < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn stdin_reaches_the_child() {
        let runner = ProcessRunner::new(["/bin/cat"]);
        let outcome = runner
            .run(RunRequest::new(["/bin/cat"]).stdin(b"piped input".to_vec()))
            .await
            .unwrap();
        assert_eq!(outcome.stdout, "piped input");
    }
}
