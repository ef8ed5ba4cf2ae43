//! `ProcessInvoker` — runs each task handler in a dedicated worker process.
//!
//! Isolation contract: the interpreter and the worker share no memory.  Input
//! and execution context travel to the worker through environment variables;
//! the result comes back as a single stdout line wrapping the value in the
//! invocation's unique tag (`{"<tag>": <result>}`).  Everything else the
//! worker prints is treated as diagnostics, so a chatty handler cannot
//! confuse the interpreter.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{HandlerRef, RuntimeContext, TaskError, TaskInvocation, TaskInvoker};

// ---------------------------------------------------------------------------
// WorkerLauncher
// ---------------------------------------------------------------------------

/// Builds the command line for one worker process.
///
/// This is the seam between the invocation protocol (env vars, tag envelope,
/// timeout, cleanup — owned by [`ProcessInvoker`]) and the concrete runtime
/// that hosts handler code.
pub trait WorkerLauncher: Send + Sync {
    /// Produce the command to spawn for `handler`.  The invoker sets stdio,
    /// the `event`/`context`/`result_tag` environment variables, and
    /// kill-on-drop on the returned command before spawning it.
    fn command(&self, handler: &HandlerRef, invocation: &TaskInvocation) -> Command;
}

/// Launches Node.js workers: evaluates a one-liner that requires the handler
/// module, calls the exported function with the parsed `event` and `context`
/// env vars, and prints the resolved value inside the tag envelope.
#[derive(Debug, Clone, Default)]
pub struct NodeLauncher {
    /// Directory the handler module path is resolved against.
    pub working_dir: Option<PathBuf>,
}

impl NodeLauncher {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: Some(working_dir.into()),
        }
    }
}

impl WorkerLauncher for NodeLauncher {
    fn command(&self, handler: &HandlerRef, _invocation: &TaskInvocation) -> Command {
        // exit(0) in then() is deliberate: a handler that opened a database
        // or socket connection would otherwise keep the worker alive forever.
        let script = format!(
            "Promise.resolve(require(\"./{module}\").{function}(\
             JSON.parse(process.env.event), JSON.parse(process.env.context)))\
             .then((data) => {{ \
             console.log(JSON.stringify({{ [process.env.result_tag]: data }})); \
             process.exit(0); }})\
             .catch((e) => {{ console.error(e); process.exit(1); }})",
            module = handler.module,
            function = handler.function,
        );

        let mut cmd = Command::new("node");
        cmd.arg("-e").arg(script);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

// ---------------------------------------------------------------------------
// ProcessInvoker
// ---------------------------------------------------------------------------

/// [`TaskInvoker`] that spawns one worker process per invocation and enforces
/// the tagged-envelope result protocol, a hard timeout, and guaranteed
/// worker termination on every exit path.
pub struct ProcessInvoker {
    launcher: Box<dyn WorkerLauncher>,
}

impl ProcessInvoker {
    pub fn new(launcher: impl WorkerLauncher + 'static) -> Self {
        Self {
            launcher: Box::new(launcher),
        }
    }

    /// Convenience constructor for the Node.js runtime.
    pub fn node(working_dir: Option<PathBuf>) -> Self {
        Self::new(NodeLauncher { working_dir })
    }
}

#[async_trait]
impl TaskInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        handler: &HandlerRef,
        input: Value,
        ctx: &RuntimeContext,
        timeout: Duration,
    ) -> Result<Value, TaskError> {
        let invocation = TaskInvocation::new(input, timeout);

        let event = serde_json::to_string(&invocation.input).map_err(|e| TaskError::BadResult {
            handler: handler.to_string(),
            detail: format!("input is not serializable: {e}"),
        })?;
        let context = serde_json::to_string(ctx).map_err(|e| TaskError::BadResult {
            handler: handler.to_string(),
            detail: format!("context is not serializable: {e}"),
        })?;

        let mut cmd = self.launcher.command(handler, &invocation);
        cmd.env("event", event)
            .env("context", context)
            .env("result_tag", &invocation.result_tag)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // the worker dies with us even if this future is cancelled
            .kill_on_drop(true);

        // Give the worker its own process group, so a timeout can take down
        // whatever the handler forked, not just the direct child.
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(handler = %handler, tag = %invocation.result_tag, "spawning task worker");

        let mut child = cmd.spawn().map_err(|source| TaskError::Spawn {
            handler: handler.to_string(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| TaskError::Spawn {
            handler: handler.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "worker stdout not captured"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| TaskError::Spawn {
            handler: handler.to_string(),
            source: io::Error::new(io::ErrorKind::Other, "worker stderr not captured"),
        })?;

        // Scan stdout for the first envelope bearing our tag; pass every
        // other line through to the log so handler prints stay visible.
        let tag = invocation.result_tag.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut result: Option<Value> = None;
            while let Ok(Some(line)) = lines.next_line().await {
                if result.is_none() {
                    if let Some(value) = extract_envelope(&line, &tag) {
                        result = Some(value);
                        continue;
                    }
                }
                debug!("[worker stdout] {line}");
            }
            result
        });

        // Stderr is diagnostics, never a failure signal on its own.
        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = String::new();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[worker stderr] {line}");
                if !collected.is_empty() {
                    collected.push('\n');
                }
                collected.push_str(&line);
            }
            collected
        });

        let status = match tokio::time::timeout(invocation.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                return Err(TaskError::Spawn {
                    handler: handler.to_string(),
                    source,
                });
            }
            Err(_elapsed) => {
                kill_worker_group(&mut child);
                let _ = child.wait().await;
                stdout_task.abort();
                let diagnostics = drain_stderr(stderr_task).await;
                warn!(handler = %handler, "task worker killed after timeout");
                return Err(TaskError::Timeout {
                    handler: handler.to_string(),
                    timeout_millis: invocation.timeout.as_millis() as u64,
                    diagnostics,
                });
            }
        };

        let result = stdout_task.await.unwrap_or(None);
        let diagnostics = drain_stderr(stderr_task).await;

        match result {
            Some(value) => Ok(value),
            None => Err(TaskError::Crashed {
                handler: handler.to_string(),
                exit: describe_exit(&status),
                diagnostics,
            }),
        }
    }
}

/// Kill the worker and everything it spawned.  Descendants inherit the
/// worker's process group, so signalling the negative pgid reaches them all;
/// `start_kill` stays as the fallback for platforms without process groups.
fn kill_worker_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    let _ = child.start_kill();
}

/// Collect whatever the worker wrote to stderr.  Bounded: an orphaned
/// descendant still holding the pipe open must not block the invoker, so
/// after a short grace the drain is abandoned.
async fn drain_stderr(mut task: JoinHandle<String>) -> String {
    match tokio::time::timeout(Duration::from_millis(250), &mut task).await {
        Ok(collected) => collected.unwrap_or_default(),
        Err(_elapsed) => {
            task.abort();
            String::new()
        }
    }
}

/// Parse a stdout line as `{"<tag>": <value>}` and extract the value.
/// Non-JSON lines and JSON without the tag are not envelopes.
fn extract_envelope(line: &str, tag: &str) -> Option<Value> {
    let parsed: Value = serde_json::from_str(line.trim()).ok()?;
    parsed.as_object()?.get(tag).cloned()
}

fn describe_exit(status: &ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
