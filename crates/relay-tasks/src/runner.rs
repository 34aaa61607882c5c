//! Operation runners

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::operation::OperationId;
use crate::project::{Phase, Project};

/// Everything a runner gets to know about the operation it executes
#[derive(Debug, Clone)]
pub struct RunnerContext {
    /// Operation being executed
    pub id: OperationId,
    /// Owning project
    pub project: Arc<Project>,
    /// Phase being run
    pub phase: Arc<Phase>,
    /// Workspace root
    pub root_dir: PathBuf,
    /// Cache fingerprint, when one was computed
    pub fingerprint: Option<Fingerprint>,
}

impl RunnerContext {
    /// Command the project resolves for this phase
    pub fn command(&self) -> Option<&str> {
        self.phase
            .command_for(&self.project)
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }

    /// Directory the command runs in
    pub fn working_dir(&self) -> PathBuf {
        self.root_dir.join(&self.project.folder)
    }
}

/// How a runner invocation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerStatus {
    Success,
    /// Succeeded, but produced diagnostics worth surfacing
    SuccessWithWarnings,
    Failure(String),
}

/// Result of a runner invocation
#[derive(Debug, Clone)]
pub struct RunnerOutput {
    pub status: RunnerStatus,
    pub duration: Duration,
    /// Captured output
    pub log: String,
}

impl RunnerOutput {
    pub fn new(status: RunnerStatus, duration: Duration, log: impl Into<String>) -> Self {
        Self {
            status,
            duration,
            log: log.into(),
        }
    }

    /// Failure with no captured output
    pub fn failure(error: impl Into<String>, duration: Duration) -> Self {
        Self::new(RunnerStatus::Failure(error.into()), duration, "")
    }
}

/// Executes the work behind an operation.
///
/// The executor invokes a runner at most once per operation per run, and never
/// for operations restored from the cache or without work.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Whether there is anything to run for this operation
    fn has_work(&self, ctx: &RunnerContext) -> bool {
        ctx.command().is_some()
    }

    /// Run the operation
    async fn execute(&self, ctx: &RunnerContext) -> RunnerOutput;
}

/// Runs the resolved command with `sh -c` in the project folder
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    timeout: Option<Duration>,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail operations that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Runner for ShellRunner {
    async fn execute(&self, ctx: &RunnerContext) -> RunnerOutput {
        let start = Instant::now();
        let Some(cmd) = ctx.command() else {
            return RunnerOutput::new(RunnerStatus::Success, Duration::ZERO, "");
        };

        debug!(operation = %ctx.id, command = cmd, "spawning shell command");

        let spawned = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .current_dir(ctx.working_dir())
            .envs(&ctx.phase.env)
            .env("RELAY_PROJECT", &ctx.project.name)
            .env("RELAY_PHASE", &ctx.phase.name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => return RunnerOutput::failure(format!("Failed to spawn: {}", e), start.elapsed()),
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let finished = async {
            let (stdout_lines, stderr_lines) = tokio::join!(read_lines(stdout), read_lines(stderr));
            let status = child.wait().await;
            (stdout_lines, stderr_lines, status)
        };

        let (stdout_lines, stderr_lines, status) = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, finished).await {
                Ok(result) => result,
                Err(_) => {
                    let _ = child.kill().await;
                    return RunnerOutput::failure(
                        format!("Timed out after {:.1}s", limit.as_secs_f64()),
                        start.elapsed(),
                    );
                }
            },
            None => finished.await,
        };

        let mut log = stdout_lines.join("\n");
        if !stderr_lines.is_empty() {
            if !log.is_empty() {
                log.push('\n');
            }
            log.push_str(&stderr_lines.join("\n"));
        }

        let status = match status {
            Ok(status) if status.success() && stderr_lines.is_empty() => RunnerStatus::Success,
            Ok(status) if status.success() => RunnerStatus::SuccessWithWarnings,
            Ok(status) => RunnerStatus::Failure(format!(
                "Command exited with code {}",
                status.code().unwrap_or(-1)
            )),
            Err(e) => RunnerStatus::Failure(format!("Failed to wait: {}", e)),
        };

        RunnerOutput::new(status, start.elapsed(), log)
    }
}

/// Drain a pipe to EOF, decoding each line lossily.
///
/// Stopping early would close the pipe under a still-writing child.
async fn read_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<String> {
    let mut collected = Vec::new();
    let Some(reader) = reader else {
        return collected;
    };

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = buf.strip_suffix(b"\n").unwrap_or(&buf);
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                collected.push(String::from_utf8_lossy(line).into_owned());
            }
            Err(e) => {
                debug!(error = %e, "failed to read command output");
                break;
            }
        }
    }
    collected
}
