//! Error types for the scheduler.

use thiserror::Error;

use crate::EngineState;

/// Errors returned by scheduler lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// The requested lifecycle transition is not valid from the current state.
    #[error("invalid state: expected {expected}, scheduler is {actual}")]
    InvalidState {
        expected: EngineState,
        actual: EngineState,
    },
}

/// Errors produced by a single task run.
///
/// These never reach the engine. They are recorded in the task's status,
/// reported to the observer and delivered to the task's [`Completion`].
///
/// [`Completion`]: crate::Completion
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    /// The task function reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The task function panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Build a [`TaskError::Failed`] from anything printable.
    pub fn msg(message: impl std::fmt::Display) -> Self {
        Self::Failed(message.to_string())
    }
}
