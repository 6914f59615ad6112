//! In-process simulated worker fleet.
//!
//! [`SimulatedTransport`] stands in for the RPC layer in the demo binary and
//! in tests. Each worker follows a [`WorkerBehavior`]; tasks a worker accepts
//! are kept until [`SimulatedTransport::take_report`] turns them into a
//! heartbeat report.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use taskfleet_core::{Signature, Task, TaskType, WorkerId};

use crate::transport::{AgentTransport, SubmitOutcome, TaskAck, TransportError, WorkerReport};

/// How a simulated worker answers submits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerBehavior {
    /// Finish every task within the RPC.
    FinishImmediately,
    /// Accept, then report the tasks finished in the next heartbeat.
    AcceptAndReport,
    /// Accept and keep reporting the tasks as running forever.
    AcceptAndHold,
    /// Accept and then lose the tasks: they are never reported at all.
    AcceptAndForget,
    /// Refuse every task.
    Reject(String),
    /// Fail the RPC as unreachable.
    Unreachable,
    /// Never answer the RPC.
    NoAnswer,
}

#[derive(Default)]
struct WorkerSim {
    /// Accepted and not yet reported finished.
    accepted: Vec<(TaskType, Signature)>,
    /// Accepted and held as running.
    held: Vec<(TaskType, Signature)>,
}

/// Simulated fleet implementing [`AgentTransport`].
pub struct SimulatedTransport {
    default_behavior: WorkerBehavior,
    behaviors: Mutex<HashMap<WorkerId, WorkerBehavior>>,
    workers: Mutex<BTreeMap<WorkerId, WorkerSim>>,
    submits: AtomicUsize,
}

impl SimulatedTransport {
    /// Fleet where every worker follows `default_behavior` unless overridden.
    pub fn new(default_behavior: WorkerBehavior) -> Self {
        Self {
            default_behavior,
            behaviors: Mutex::new(HashMap::new()),
            workers: Mutex::new(BTreeMap::new()),
            submits: AtomicUsize::new(0),
        }
    }

    /// Builder method to override one worker's behaviour.
    pub fn with_worker(self, worker_id: WorkerId, behavior: WorkerBehavior) -> Self {
        self.set_behavior(worker_id, behavior);
        self
    }

    pub fn set_behavior(&self, worker_id: WorkerId, behavior: WorkerBehavior) {
        self.behaviors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(worker_id, behavior);
    }

    fn behavior(&self, worker_id: &WorkerId) -> WorkerBehavior {
        self.behaviors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(worker_id)
            .cloned()
            .unwrap_or_else(|| self.default_behavior.clone())
    }

    fn workers(&self) -> MutexGuard<'_, BTreeMap<WorkerId, WorkerSim>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of submit RPCs received.
    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    /// Workers that have received at least one task.
    pub fn known_workers(&self) -> Vec<WorkerId> {
        self.workers().keys().cloned().collect()
    }

    /// Heartbeat report for `worker_id`. Accepted tasks are reported finished
    /// once; held tasks are reported running every time.
    pub fn take_report(&self, worker_id: &WorkerId) -> WorkerReport {
        let mut workers = self.workers();
        let sim = workers.entry(worker_id.clone()).or_default();
        let mut report = WorkerReport::new(worker_id.clone());

        for task_type in TaskType::ALL {
            report = report.with_running(task_type, Vec::<Signature>::new());
        }
        for (task_type, signature) in sim.accepted.drain(..) {
            report = report.with_finished(task_type, [signature]);
        }
        for (task_type, signature) in &sim.held {
            report = report.with_running(*task_type, [*signature]);
        }
        report
    }
}

#[async_trait]
impl AgentTransport for SimulatedTransport {
    async fn submit(
        &self,
        worker_id: &WorkerId,
        batch: Vec<Task>,
    ) -> Result<SubmitOutcome, TransportError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior(worker_id);
        debug!(
            worker_id = %worker_id,
            tasks = batch.len(),
            behavior = ?behavior,
            "Simulated submit"
        );

        let ack = match &behavior {
            WorkerBehavior::Unreachable => {
                return Err(TransportError::Unreachable(
                    worker_id.clone(),
                    "connection refused".to_string(),
                ))
            }
            WorkerBehavior::NoAnswer => std::future::pending::<TaskAck>().await,
            WorkerBehavior::Reject(reason) => TaskAck::Rejected(reason.clone()),
            WorkerBehavior::FinishImmediately => TaskAck::Finished,
            WorkerBehavior::AcceptAndForget => TaskAck::Accepted,
            WorkerBehavior::AcceptAndReport | WorkerBehavior::AcceptAndHold => {
                let mut workers = self.workers();
                let sim = workers.entry(worker_id.clone()).or_default();
                let slot = if matches!(behavior, WorkerBehavior::AcceptAndHold) {
                    &mut sim.held
                } else {
                    &mut sim.accepted
                };
                slot.extend(batch.iter().map(|t| (t.task_type(), t.signature)));
                TaskAck::Accepted
            }
        };

        self.workers().entry(worker_id.clone()).or_default();
        Ok(SubmitOutcome::all(&batch, ack))
    }
}
