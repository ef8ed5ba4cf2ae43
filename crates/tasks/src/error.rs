//! Task-invocation error type.

use thiserror::Error;

/// Errors returned by a [`TaskInvoker`](crate::TaskInvoker).
///
/// The engine uses the variant to classify the terminal failure of the
/// execution; it never retries past either of them.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The worker did not finish within the configured timeout.  The worker
    /// process has already been killed by the time this is returned.
    #[error("task '{handler}' timed out after {timeout_millis}ms")]
    Timeout {
        handler: String,
        timeout_millis: u64,
        /// Anything the worker wrote to stderr before it was killed.
        diagnostics: String,
    },

    /// The worker exited without ever emitting a tagged result envelope.
    #[error("task '{handler}' exited without a result ({exit}): {diagnostics}")]
    Crashed {
        handler: String,
        /// Human-readable exit status (code or signal).
        exit: String,
        diagnostics: String,
    },

    /// The worker process could not be started at all.
    #[error("failed to spawn worker for '{handler}': {source}")]
    Spawn {
        handler: String,
        #[source]
        source: std::io::Error,
    },

    /// The tagged envelope carried something that is not valid JSON.
    #[error("task '{handler}' produced an unreadable result: {detail}")]
    BadResult { handler: String, detail: String },
}
