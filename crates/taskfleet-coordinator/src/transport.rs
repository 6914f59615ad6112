//! Seam to the worker-facing RPC layer.
//!
//! The coordinator never encodes anything on the wire itself. It hands a
//! batch of tasks to an [`AgentTransport`] and gets back per-task acks, and it
//! receives [`WorkerReport`]s from whatever drives worker heartbeats.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;

use taskfleet_core::{Signature, Task, TaskType, WorkerId};

/// RPC-level failure. Distinct from a worker explicitly rejecting a task.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The worker could not be reached.
    #[error("Worker {0} unreachable: {1}")]
    Unreachable(WorkerId, String),

    /// The RPC did not complete in time.
    #[error("Submit to worker {0} timed out")]
    Timeout(WorkerId),

    /// The worker answered with something unusable.
    #[error("Protocol error from worker {0}: {1}")]
    Protocol(WorkerId, String),
}

/// Worker's synchronous answer for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAck {
    /// Accepted; completion arrives with a later report.
    Accepted,
    /// Already done by the time the RPC returned.
    Finished,
    /// Refused by the worker.
    Rejected(String),
}

/// Per-task answer to one submitted batch.
#[derive(Debug, Clone, Default)]
pub struct SubmitOutcome {
    pub acks: HashMap<Signature, TaskAck>,
}

impl SubmitOutcome {
    /// Outcome acking every task in `batch` the same way.
    pub fn all(batch: &[Task], ack: TaskAck) -> Self {
        Self {
            acks: batch.iter().map(|t| (t.signature, ack.clone())).collect(),
        }
    }

    /// Builder method to set the ack of one task.
    pub fn with_ack(mut self, signature: Signature, ack: TaskAck) -> Self {
        self.acks.insert(signature, ack);
        self
    }
}

/// Ships task batches to workers.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Submit `batch` to `worker_id`. Order within the batch is preserved.
    async fn submit(
        &self,
        worker_id: &WorkerId,
        batch: Vec<Task>,
    ) -> Result<SubmitOutcome, TransportError>;
}

/// Periodic self-report of one worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub worker_id: WorkerId,

    /// Signatures finished since the last report, per task type.
    pub finished: HashMap<TaskType, HashSet<Signature>>,

    /// Signatures the worker is still executing, per task type. `None` when
    /// the worker did not include its running set.
    pub running: Option<HashMap<TaskType, HashSet<Signature>>>,
}

impl WorkerReport {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            finished: HashMap::new(),
            running: None,
        }
    }

    /// Builder method to add finished signatures.
    pub fn with_finished(
        mut self,
        task_type: TaskType,
        signatures: impl IntoIterator<Item = Signature>,
    ) -> Self {
        self.finished.entry(task_type).or_default().extend(signatures);
        self
    }

    /// Builder method to add running signatures.
    pub fn with_running(
        mut self,
        task_type: TaskType,
        signatures: impl IntoIterator<Item = Signature>,
    ) -> Self {
        self.running
            .get_or_insert_with(HashMap::new)
            .entry(task_type)
            .or_default()
            .extend(signatures);
        self
    }
}
