//! External tool abstractions
//!
//! Trait-based wrapper around out-of-process tools so that pure decision
//! logic stays separate from process execution and can be tested with mocks.

pub mod command;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};

#[cfg(any(test, feature = "testing"))]
pub use command::MockCommandExecutor;
