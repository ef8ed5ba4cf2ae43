//! `tasks` crate — the `TaskInvoker` trait and the process-isolated invoker.
//!
//! Every way of running a Task state's handler — the real worker process and
//! test doubles alike — implements [`TaskInvoker`].  The engine crate
//! dispatches Task states through this trait object.

pub mod error;
pub mod invoker;
pub mod mock;
pub mod process;

pub use error::TaskError;
pub use invoker::{HandlerRef, RuntimeContext, TaskInvocation, TaskInvoker};
pub use process::{NodeLauncher, ProcessInvoker, WorkerLauncher};
