//! The `TaskInvoker` trait — the contract for running a Task state's handler.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::TaskError;

// ---------------------------------------------------------------------------
// HandlerRef
// ---------------------------------------------------------------------------

/// Reference to a user handler: a module path plus an exported function name,
/// written `"module.function"` in the definition document.
///
/// Defined here (in the tasks crate) so both the engine's definition model and
/// the invoker implementations can use it without a circular dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerRef {
    pub module: String,
    pub function: String,
}

impl FromStr for HandlerRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('.') {
            Some((module, function)) if !module.is_empty() && !function.is_empty() => {
                Ok(Self {
                    module: module.to_owned(),
                    function: function.to_owned(),
                })
            }
            _ => Err(format!(
                "handler reference '{s}' is not of the form 'module.function'"
            )),
        }
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.function)
    }
}

impl<'de> Deserialize<'de> for HandlerRef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// RuntimeContext
// ---------------------------------------------------------------------------

/// Execution metadata handed to the handler alongside its input, serialized
/// into the worker's `context` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeContext {
    pub execution_id: String,
    pub state_machine: String,
    pub state_name: String,
}

// ---------------------------------------------------------------------------
// TaskInvocation
// ---------------------------------------------------------------------------

/// Ephemeral per-call record: the input, the single-use result tag, and the
/// deadline.  Discarded once the result or failure is obtained.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    /// JSON value the handler receives as its event.
    pub input: Value,
    /// Unique tag the worker must wrap its result in.  Lets the invoker tell
    /// the actual result apart from incidental prints by the handler or its
    /// transitive code.
    pub result_tag: String,
    pub timeout: Duration,
}

impl TaskInvocation {
    pub fn new(input: Value, timeout: Duration) -> Self {
        Self {
            input,
            result_tag: format!("sf-{}", Uuid::new_v4()),
            timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// TaskInvoker
// ---------------------------------------------------------------------------

/// The core invocation trait.
///
/// Implementations must isolate the handler from the caller: a crash, hang,
/// or excessive output inside `invoke` may fail the call but must never
/// corrupt the caller's state.
#[async_trait]
pub trait TaskInvoker: Send + Sync {
    /// Run the handler with `input`, returning its JSON result.
    ///
    /// `timeout` bounds the whole invocation; on expiry the implementation
    /// must tear down whatever it started and return [`TaskError::Timeout`].
    async fn invoke(
        &self,
        handler: &HandlerRef,
        input: Value,
        ctx: &RuntimeContext,
        timeout: Duration,
    ) -> Result<Value, TaskError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_ref_parses_module_and_function() {
        let h: HandlerRef = "handlers/orders.process".parse().unwrap();
        assert_eq!(h.module, "handlers/orders");
        assert_eq!(h.function, "process");
        assert_eq!(h.to_string(), "handlers/orders.process");
    }

    #[test]
    fn handler_ref_splits_on_last_dot() {
        let h: HandlerRef = "src/v2.handler.main".parse().unwrap();
        assert_eq!(h.module, "src/v2.handler");
        assert_eq!(h.function, "main");
    }

    #[test]
    fn handler_ref_rejects_missing_function() {
        assert!("justamodule".parse::<HandlerRef>().is_err());
        assert!("module.".parse::<HandlerRef>().is_err());
        assert!(".function".parse::<HandlerRef>().is_err());
    }

    #[test]
    fn invocation_tags_are_unique() {
        let a = TaskInvocation::new(Value::Null, Duration::from_secs(1));
        let b = TaskInvocation::new(Value::Null, Duration::from_secs(1));
        assert_ne!(a.result_tag, b.result_tag);
        assert!(a.result_tag.starts_with("sf-"));
    }
}
