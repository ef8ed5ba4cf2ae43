//! Engine-level error types (definition load + execution).

use tasks::TaskError;
use thiserror::Error;

/// Errors detected while loading a definition document.  Fatal: a machine
/// that fails validation is never run.
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The document is not valid JSON or does not match the expected shape.
    #[error("definition document is malformed: {0}")]
    Parse(#[from] serde_json::Error),

    /// `StartAt` names a state that is not defined in `States`.
    #[error("machine '{machine}': start state '{start_at}' is not defined")]
    MissingStartState { machine: String, start_at: String },

    /// A `Next` or `Default` references a state that does not exist.
    #[error("machine '{machine}': state '{state}' transitions to undefined state '{target}'")]
    DanglingTransition {
        machine: String,
        state: String,
        target: String,
    },

    /// A non-terminal state must declare exactly one of `Next` or `End: true`.
    #[error("machine '{machine}': state '{state}' must declare exactly one of Next or End")]
    InvalidTransition { machine: String, state: String },

    /// A choice rule is structurally invalid (zero or multiple comparator
    /// keys, missing Variable/Next, unknown comparator, ...).
    #[error("machine '{machine}': choice state '{state}': {detail}")]
    InvalidChoiceRule {
        machine: String,
        state: String,
        detail: String,
    },

    /// A Wait state must carry exactly one duration field.
    #[error(
        "machine '{machine}': wait state '{state}' needs exactly one of \
         Seconds, SecondsPath, Timestamp, TimestampPath"
    )]
    InvalidWait { machine: String, state: String },
}

/// JSON-path resolution failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    #[error("malformed JSON path '{path}': {detail}")]
    Malformed { path: String, detail: String },

    #[error("path '{path}' matches nothing in the data")]
    NoMatch { path: String },
}

/// Errors that move one execution to the `Failed` terminal state.  They
/// never crash the driver and never affect concurrent executions.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("state machine '{0}' is not defined")]
    MachineNotFound(String),

    #[error("state '{state}' is not defined in machine '{machine}'")]
    StateNotFound { machine: String, state: String },

    /// A non-terminal state without a `Next` was reached at runtime.  Caught
    /// by validation for loaded definitions.
    #[error("state '{state}' has no Next and is not terminal")]
    MissingNext { state: String },

    #[error(transparent)]
    Path(#[from] PathError),

    #[error("no choice rule matched in state '{state}' and no Default is set")]
    NoMatchingChoice { state: String },

    /// A comparison could not be carried out (bad operand type, unparseable
    /// timestamp, structurally invalid rule).
    #[error("choice comparison failed: {0}")]
    Comparison(String),

    #[error("wait state '{state}': {detail}")]
    Wait { state: String, detail: String },

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("state '{state}': '{kind}' states are not supported")]
    Unsupported { state: String, kind: &'static str },

    /// A `Fail` state was reached; carries its diagnostic fields.
    #[error(
        "execution failed in state '{state}': {}: {}",
        error.as_deref().unwrap_or("States.TaskFailed"),
        cause.as_deref().unwrap_or("no cause given")
    )]
    StateFailed {
        state: String,
        error: Option<String>,
        cause: Option<String>,
    },

    #[error("execution exceeded {0} transitions; the definition likely loops")]
    TransitionLimit(u32),

    #[error("execution was cancelled")]
    Cancelled,
}
