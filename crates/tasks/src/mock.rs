//! `MockInvoker` — a test double for `TaskInvoker`.
//!
//! Useful in unit and integration tests where spawning a real worker process
//! is either unavailable or irrelevant.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{HandlerRef, RuntimeContext, TaskError, TaskInvocation, TaskInvoker};

/// Behaviour injected into `MockInvoker` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail as if the worker crashed.
    Crash(String),
    /// Fail as if the worker timed out.
    Timeout,
}

/// A mock invoker that records every call it receives and returns a
/// programmer-specified result.
pub struct MockInvoker {
    pub behaviour: MockBehaviour,
    /// `(handler, input)` pairs seen by this invoker, in call order.
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl MockInvoker {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(value: Value) -> Self {
        Self {
            behaviour: MockBehaviour::ReturnValue(value),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails as a crashed worker.
    pub fn crashing(msg: impl Into<String>) -> Self {
        Self {
            behaviour: MockBehaviour::Crash(msg.into()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Create a mock that always fails as a timed-out worker.
    pub fn timing_out() -> Self {
        Self {
            behaviour: MockBehaviour::Timeout,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of times this invoker has been called.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// The input the n-th call received.
    pub fn input_of_call(&self, n: usize) -> Value {
        self.calls.lock().unwrap()[n].1.clone()
    }
}

#[async_trait]
impl TaskInvoker for MockInvoker {
    async fn invoke(
        &self,
        handler: &HandlerRef,
        input: Value,
        _ctx: &RuntimeContext,
        timeout: Duration,
    ) -> Result<Value, TaskError> {
        self.calls
            .lock()
            .unwrap()
            .push((handler.to_string(), input.clone()));

        // Keep the per-call record honest even though nothing runs.
        let invocation = TaskInvocation::new(input, timeout);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(v.clone()),
            MockBehaviour::Crash(msg) => Err(TaskError::Crashed {
                handler: handler.to_string(),
                exit: "exit code 1".into(),
                diagnostics: msg.clone(),
            }),
            MockBehaviour::Timeout => Err(TaskError::Timeout {
                handler: handler.to_string(),
                timeout_millis: invocation.timeout.as_millis() as u64,
                diagnostics: String::new(),
            }),
        }
    }
}
