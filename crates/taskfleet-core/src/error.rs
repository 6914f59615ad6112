//! Core domain errors.

use thiserror::Error;

use crate::TaskState;

/// Core domain errors for TaskFleet.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid task state transition.
    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: TaskState, to: TaskState },

    /// Invalid input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
