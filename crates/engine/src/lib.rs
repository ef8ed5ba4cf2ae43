//! `engine` crate — definition model, choice evaluation, data-flow
//! transforms, and the state-machine execution driver.

pub mod choice;
pub mod definition;
pub mod driver;
pub mod error;
pub mod paths;

pub use definition::{Definitions, State, StateMachine};
pub use driver::{ExecutionHandle, ExecutionResult, Executor, ExecutorConfig, Outcome};
pub use error::{DefinitionError, ExecutionError, PathError};
pub use paths::PathSpec;
