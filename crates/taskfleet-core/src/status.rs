//! Status enums for agent tasks and leader-only tasks.

use serde::{Deserialize, Serialize};

/// State of an agent task bound for a worker.
///
/// States only move forward through `Pending -> Sent -> terminal`. The single
/// exception is `Sent -> Pending`, used when a task is reset for a resend.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    /// Registered but not yet shipped to the worker.
    #[default]
    Pending,
    /// Shipped to the worker, awaiting completion.
    Sent,
    /// Worker reported success.
    Finished,
    /// Worker rejected the task or the transport failed.
    Failed,
    /// Deadline elapsed before the worker reported completion.
    TimedOut,
}

impl TaskState {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::TimedOut)
    }

    /// Returns true if the task is still outstanding.
    pub fn is_outstanding(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether moving from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Sent) => true,
            (Self::Sent, Self::Pending) => true,
            (from, to) if from.is_outstanding() && to.is_terminal() => true,
            _ => false,
        }
    }
}

/// Status of a task owned by the leader task runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderTaskStatus {
    /// Waiting for a dispatch slot.
    #[default]
    Queued,
    /// Executing on the leader.
    Running,
    /// Finished successfully.
    Done,
    /// Failed or exceeded its deadline.
    Failed,
    /// Cancelled by the caller or by leadership loss.
    Cancelled,
}

impl LeaderTaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}
