//! Command execution primitives.
//!
//! Raw command lines run through `sh -c` with both output streams captured
//! and teed to the log. Structured commands dispatch through a
//! [`CommandRegistry`] of named [`CommandHandler`]s running in-process.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::execution::heartbeat::ProgressRecorder;

/// Errors from launching or dispatching a command.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to spawn command: {0}")]
    Spawn(std::io::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown command handler: {0}")]
    UnknownHandler(String),

    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

/// What a finished (or interrupted) raw command produced.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    /// None when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// True when the run was cancelled and the process killed.
    pub cancelled: bool,
}

/// Run a shell command line, capturing stdout and stderr.
///
/// Output lines are teed to the log as they arrive so long-running jobs are
/// observable mid-run. Cancelling the token kills the process group leader
/// and returns whatever output was captured up to that point.
pub async fn run_raw(line: &str, cancel: &CancellationToken) -> Result<CapturedOutput, TaskError> {
    debug!(command = %line, "spawning shell command");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(line)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TaskError::Spawn)?;

    // stdout/stderr are always piped, so take() cannot return None
    let stdout = child.stdout.take().ok_or_else(|| {
        TaskError::HandlerFailed("child stdout not captured".to_string())
    })?;
    let stderr = child.stderr.take().ok_or_else(|| {
        TaskError::HandlerFailed("child stderr not captured".to_string())
    })?;

    let out_task = tokio::spawn(drain_stream(stdout, false));
    let err_task = tokio::spawn(drain_stream(stderr, true));

    let mut captured = CapturedOutput::default();
    tokio::select! {
        status = child.wait() => {
            captured.exit_code = status?.code();
        }
        _ = cancel.cancelled() => {
            info!(command = %line, "run cancelled, killing process");
            let _ = child.start_kill();
            let status = child.wait().await?;
            captured.exit_code = status.code();
            captured.cancelled = true;
        }
    }

    captured.stdout = out_task.await.unwrap_or_default();
    captured.stderr = err_task.await.unwrap_or_default();
    Ok(captured)
}

/// Read a child stream line by line, teeing each line to the log.
async fn drain_stream<R: AsyncRead + Unpin>(stream: R, is_err: bool) -> String {
    let mut lines = BufReader::new(stream).lines();
    let mut body = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_err {
            debug!(target: "cadence::job_stderr", "{line}");
        } else {
            debug!(target: "cadence::job_stdout", "{line}");
        }
        body.push_str(&line);
        body.push('\n');
    }
    body
}

/// Output sinks and progress reporting for an in-process handler.
pub struct CommandContext {
    pub stdout: String,
    pub stderr: String,
    /// Present when a heartbeat is attached to the run.
    pub progress: Option<ProgressRecorder>,
}

impl CommandContext {
    pub fn new(progress: Option<ProgressRecorder>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            progress,
        }
    }

    /// Append a line to the captured stdout.
    pub fn write_stdout(&mut self, line: &str) {
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    /// Append a line to the captured stderr. Any stderr fails the run.
    pub fn write_stderr(&mut self, line: &str) {
        self.stderr.push_str(line);
        self.stderr.push('\n');
    }
}

/// An in-process command invocable by name from a structured job.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// The name jobs refer to this handler by.
    fn name(&self) -> &str;

    /// Run the command. Positional arguments and `key=value` options are
    /// pre-split from the job's argument string.
    async fn run(
        &self,
        ctx: &mut CommandContext,
        args: &[String],
        options: &HashMap<String, String>,
    ) -> Result<(), TaskError>;
}

/// Named handlers available to structured jobs.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    handlers: HashMap<String, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its own name. Re-registering a name
    /// replaces the previous handler.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Split a structured job's argument string into positionals and options.
///
/// The string is shell-split; tokens of the form `key=value` become options
/// and everything else is positional, in order. An unsplittable string
/// (unbalanced quotes) yields no arguments at all.
pub fn parse_args(raw: &str) -> (Vec<String>, HashMap<String, String>) {
    let mut args = Vec::new();
    let mut options = HashMap::new();
    for token in shlex::split(raw).unwrap_or_default() {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                options.insert(key.to_string(), value.to_string());
            }
            _ => args.push(token),
        }
    }
    (args, options)
}
