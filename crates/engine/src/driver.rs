//! The execution driver: the interpreter loop that walks one state machine
//! from its start state to a terminal state.
//!
//! One driver pass owns one execution: it fetches the current node from the
//! definition model, scopes the input, dispatches on the node type, projects
//! the result, and decides the next state or terminates.  Multiple
//! executions run concurrently with no shared mutable state — only the
//! `Arc<Definitions>` table, which is read-only after load.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument};

use tasks::{RuntimeContext, TaskInvoker};

use crate::definition::{Definitions, State, StateMachine, WaitState};
use crate::error::ExecutionError;
use crate::{choice, paths};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Timeout for Task invocations that don't declare `TimeoutSeconds`.
    pub task_timeout: Duration,
    /// Upper bound on state transitions per execution; definitions may
    /// legally contain loops, so runaway ones must be cut off.
    pub max_transitions: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            task_timeout: Duration::from_secs(30),
            max_transitions: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Execution identity & outcome
// ---------------------------------------------------------------------------

/// Per-execution state the driver owns and mutates once per transition.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: String,
    pub state_machine: String,
    pub started_at: DateTime<Utc>,
    pub current_state: String,
    pub data: Value,
}

/// Terminal result of one execution.
#[derive(Debug)]
pub enum Outcome {
    Succeeded(Value),
    Failed(ExecutionError),
}

impl Outcome {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }
}

/// What a completed execution hands back to the caller.
#[derive(Debug)]
pub struct ExecutionResult {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    pub outcome: Outcome,
}

/// Handle to a fire-and-continue execution started with [`Executor::start`].
pub struct ExecutionHandle {
    pub execution_id: String,
    pub started_at: DateTime<Utc>,
    join: JoinHandle<ExecutionResult>,
}

impl ExecutionHandle {
    /// Wait for the execution to reach a terminal state.
    pub async fn wait(self) -> ExecutionResult {
        let execution_id = self.execution_id;
        let started_at = self.started_at;
        match self.join.await {
            Ok(result) => result,
            // the driving task was aborted (or panicked); report as cancelled
            Err(_) => ExecutionResult {
                execution_id,
                started_at,
                outcome: Outcome::Failed(ExecutionError::Cancelled),
            },
        }
    }

    /// Cancel the execution.  Any active worker process dies with the
    /// driving task (workers are spawned kill-on-drop).
    pub fn cancel(&self) {
        self.join.abort();
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Stateless orchestrator that drives executions against a loaded
/// definition table.  Construct one and share it; each `run`/`start` call
/// is an independent execution.
pub struct Executor {
    definitions: Arc<Definitions>,
    invoker: Arc<dyn TaskInvoker>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        definitions: Arc<Definitions>,
        invoker: Arc<dyn TaskInvoker>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            definitions,
            invoker,
            config,
        }
    }

    /// Run one execution to its terminal state.
    pub async fn run(&self, machine_name: &str, input: Value) -> ExecutionResult {
        let started_at = Utc::now();
        let execution_id = self.execution_id(machine_name, started_at);
        self.run_identified(machine_name, input, started_at, execution_id)
            .await
    }

    /// Start an execution in the background and return immediately with its
    /// identity.  `handle.wait()` retrieves the terminal result.
    pub fn start(self: &Arc<Self>, machine_name: impl Into<String>, input: Value) -> ExecutionHandle {
        let executor = Arc::clone(self);
        let machine_name = machine_name.into();
        let started_at = Utc::now();
        let execution_id = executor.execution_id(&machine_name, started_at);

        let id = execution_id.clone();
        let join = tokio::spawn(async move {
            executor
                .run_identified(&machine_name, input, started_at, id)
                .await
        });

        ExecutionHandle {
            execution_id,
            started_at,
            join,
        }
    }

    /// Unique per execution instance: machine, start state, and start time.
    /// Collisions would need two starts of the same machine inside one clock
    /// millisecond, which the local use case accepts.
    fn execution_id(&self, machine_name: &str, started_at: DateTime<Utc>) -> String {
        let start_state = self
            .definitions
            .machine(machine_name)
            .map(|m| m.start_at.as_str())
            .unwrap_or("unknown");
        format!(
            "{machine_name}-{start_state}-{}",
            started_at.timestamp_millis()
        )
    }

    #[instrument(skip(self, input, started_at), fields(execution_id = %execution_id))]
    async fn run_identified(
        &self,
        machine_name: &str,
        input: Value,
        started_at: DateTime<Utc>,
        execution_id: String,
    ) -> ExecutionResult {
        info!("execution started");

        let outcome = match self.definitions.machine(machine_name) {
            None => Outcome::Failed(ExecutionError::MachineNotFound(machine_name.to_owned())),
            Some(machine) => {
                let mut ctx = ExecutionContext {
                    execution_id: execution_id.clone(),
                    state_machine: machine_name.to_owned(),
                    started_at,
                    current_state: machine.start_at.clone(),
                    data: input,
                };
                match self.drive(machine, &mut ctx).await {
                    Ok(data) => Outcome::Succeeded(data),
                    Err(e) => Outcome::Failed(e),
                }
            }
        };

        match &outcome {
            Outcome::Succeeded(_) => info!("execution succeeded"),
            Outcome::Failed(e) => error!("execution failed: {e}"),
        }

        ExecutionResult {
            execution_id,
            started_at,
            outcome,
        }
    }

    /// The interpreter loop.  Any error halts the execution; the driver
    /// never continues past one.
    async fn drive(
        &self,
        machine: &StateMachine,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, ExecutionError> {
        let mut transitions = 0u32;

        loop {
            transitions += 1;
            if transitions > self.config.max_transitions {
                return Err(ExecutionError::TransitionLimit(self.config.max_transitions));
            }

            let state =
                machine
                    .state(&ctx.current_state)
                    .ok_or_else(|| ExecutionError::StateNotFound {
                        machine: ctx.state_machine.clone(),
                        state: ctx.current_state.clone(),
                    })?;

            debug!(state = %ctx.current_state, kind = state.kind(), "entering state");

            let scoped = paths::apply_input_path(&ctx.data, state.input_path())?;

            match state {
                // Terminal immediately; Succeed surfaces the scoped input.
                State::Succeed(_) => return Ok(scoped),

                State::Fail(fail) => {
                    return Err(ExecutionError::StateFailed {
                        state: ctx.current_state.clone(),
                        error: fail.error.clone(),
                        cause: fail.cause.clone(),
                    });
                }

                State::Parallel(_) => {
                    return Err(ExecutionError::Unsupported {
                        state: ctx.current_state.clone(),
                        kind: "Parallel",
                    });
                }

                // Choice transitions without touching the data.
                State::Choice(choice_state) => {
                    let next = choice::select_next(&ctx.current_state, choice_state, &scoped)?;
                    debug!(from = %ctx.current_state, to = next, "choice matched");
                    ctx.data = scoped;
                    ctx.current_state = next.to_owned();
                }

                State::Task(task) => {
                    let timeout = task
                        .timeout_seconds
                        .map(Duration::from_secs)
                        .unwrap_or(self.config.task_timeout);
                    let runtime_ctx = RuntimeContext {
                        execution_id: ctx.execution_id.clone(),
                        state_machine: ctx.state_machine.clone(),
                        state_name: ctx.current_state.clone(),
                    };

                    let raw = self
                        .invoker
                        .invoke(&task.handler, scoped, &runtime_ctx, timeout)
                        .await?;

                    let merged = paths::apply_result_path(&ctx.data, &task.result_path, raw)?;
                    let output = paths::apply_output_path(&merged, &task.output_path)?;
                    self.transition(ctx, state, output)?;
                    if state.is_end() {
                        return Ok(ctx.data.clone());
                    }
                }

                State::Pass(pass) => {
                    let raw = pass.result.clone().unwrap_or(scoped);
                    let merged = paths::apply_result_path(&ctx.data, &pass.result_path, raw)?;
                    let output = paths::apply_output_path(&merged, &pass.output_path)?;
                    self.transition(ctx, state, output)?;
                    if state.is_end() {
                        return Ok(ctx.data.clone());
                    }
                }

                State::Wait(wait) => {
                    let delay = wait_delay(wait, &scoped, &ctx.current_state)?;
                    if !delay.is_zero() {
                        info!(state = %ctx.current_state, ?delay, "waiting");
                        tokio::time::sleep(delay).await;
                    }
                    // Wait produces no result to merge; only OutputPath runs.
                    let output = paths::apply_output_path(&scoped, &wait.output_path)?;
                    self.transition(ctx, state, output)?;
                    if state.is_end() {
                        return Ok(ctx.data.clone());
                    }
                }
            }
        }
    }

    /// Store the step's output and advance to `Next` (unless terminal).
    fn transition(
        &self,
        ctx: &mut ExecutionContext,
        state: &State,
        output: Value,
    ) -> Result<(), ExecutionError> {
        ctx.data = output;
        if state.is_end() {
            return Ok(());
        }
        let next = state.next().ok_or_else(|| ExecutionError::MissingNext {
            state: ctx.current_state.clone(),
        })?;
        debug!(from = %ctx.current_state, to = next, "transition");
        ctx.current_state = next.to_owned();
        Ok(())
    }
}

/// Compute the Wait state's delay from whichever duration field it carries.
fn wait_delay(
    wait: &WaitState,
    scoped: &Value,
    state_name: &str,
) -> Result<Duration, ExecutionError> {
    let wait_error = |detail: String| ExecutionError::Wait {
        state: state_name.to_owned(),
        detail,
    };

    // try_from_secs_f64 rejects negative, non-finite, and overflowing values
    // in one place; a bad duration fails this execution, never the driver.
    if let Some(seconds) = wait.seconds {
        return Duration::try_from_secs_f64(seconds)
            .map_err(|_| wait_error(format!("Seconds is not a valid duration: {seconds}")));
    }

    if let Some(path) = &wait.seconds_path {
        let value = paths::resolve(scoped, path)
            .map_err(|e| wait_error(format!("SecondsPath: {e}")))?;
        let seconds = value
            .as_f64()
            .ok_or_else(|| wait_error(format!("SecondsPath resolved to non-number {value}")))?;
        return Duration::try_from_secs_f64(seconds)
            .map_err(|_| wait_error(format!("SecondsPath is not a valid duration: {seconds}")));
    }

    let target = if let Some(raw) = &wait.timestamp {
        Some(parse_target(raw).ok_or_else(|| wait_error(format!("bad Timestamp '{raw}'")))?)
    } else if let Some(path) = &wait.timestamp_path {
        let value = paths::resolve(scoped, path)
            .map_err(|e| wait_error(format!("TimestampPath: {e}")))?;
        let raw = value
            .as_str()
            .ok_or_else(|| wait_error(format!("TimestampPath resolved to non-string {value}")))?;
        Some(parse_target(raw).ok_or_else(|| wait_error(format!("bad timestamp '{raw}'")))?)
    } else {
        None
    };

    match target {
        Some(target_millis) => {
            let remaining = target_millis - Utc::now().timestamp_millis();
            Ok(Duration::from_millis(remaining.max(0) as u64))
        }
        None => Err(wait_error(
            "no Seconds, SecondsPath, Timestamp, or TimestampPath".into(),
        )),
    }
}

fn parse_target(raw: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_millis())
}
