//! Batched, bounded dispatch of tasks to workers.
//!
//! Every submit RPC holds a permit from one shared semaphore, so the number
//! of in-flight RPCs never exceeds `max_dispatch_pool_size` no matter how many
//! callers submit at once. Before it queues for that permit, an RPC takes a
//! slot from its worker's own semaphore, which is always smaller than the
//! pool. A slow or unreachable worker therefore parks its extra batches on
//! its own slots and leaves pool permits for the rest of the fleet.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use taskfleet_core::{Signature, Task, TaskKey, TaskState, WorkerId};

use crate::config::Config;
use crate::latch::{CompletionLatch, FailureReason, Resolution};
use crate::queue::{EnqueueResult, TaskQueue};
use crate::transport::{AgentTransport, SubmitOutcome, TaskAck, TransportError};

/// What happened to one submitted task.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchStatus {
    /// The worker finished the task within the RPC.
    Finished,
    /// The worker accepted the task; completion comes with a later report.
    Sent,
    /// An identical task was already outstanding; nothing was sent.
    Duplicate { existing: TaskState },
    /// The worker refused the task.
    Rejected(String),
    /// The RPC carrying the task failed.
    TransportFailed(TransportError),
    /// The task reached a terminal state elsewhere before it could be sent.
    Skipped,
}

/// Per-task dispatch outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub signature: Signature,
    pub status: DispatchStatus,
}

/// Ships tasks to workers through an [`AgentTransport`].
pub struct DispatchExecutor {
    queue: Arc<TaskQueue>,
    transport: Arc<dyn AgentTransport>,
    pool: Semaphore,
    pool_size: usize,
    worker_slots: Mutex<HashMap<WorkerId, Arc<Semaphore>>>,
    per_worker_limit: usize,
    max_tasks_per_batch: usize,
    rpc_timeout: Duration,
}

impl DispatchExecutor {
    /// Create a new DispatchExecutor.
    pub fn new(config: &Config, queue: Arc<TaskQueue>, transport: Arc<dyn AgentTransport>) -> Self {
        let pool_size = config.max_dispatch_pool_size.max(1);
        // One worker may never take the whole pool unless the pool has a
        // single slot.
        let per_worker_limit = config
            .max_inflight_per_worker
            .min(pool_size - 1)
            .max(1);
        Self {
            queue,
            transport,
            pool: Semaphore::new(pool_size),
            pool_size,
            worker_slots: Mutex::new(HashMap::new()),
            per_worker_limit,
            max_tasks_per_batch: config.max_tasks_per_batch.max(1),
            rpc_timeout: config.rpc_timeout,
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// Free slots in the RPC pool.
    pub fn available_slots(&self) -> usize {
        self.pool.available_permits()
    }

    /// Effective size of the RPC pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Maximum RPCs in flight to any one worker.
    pub fn per_worker_limit(&self) -> usize {
        self.per_worker_limit
    }

    fn worker_slots(&self, worker_id: &WorkerId) -> Arc<Semaphore> {
        self.worker_slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(worker_id.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_worker_limit)))
            .clone()
    }

    /// Register `tasks` and ship the accepted ones to `worker_id`.
    ///
    /// Outcomes come back in input order. Tasks addressed to a different
    /// worker are rejected without being registered.
    pub async fn submit_batch(
        &self,
        worker_id: &WorkerId,
        tasks: Vec<Task>,
        listener: Option<&Arc<CompletionLatch>>,
    ) -> Vec<TaskOutcome> {
        let order: Vec<Signature> = tasks.iter().map(|t| t.signature).collect();
        let mut statuses: HashMap<Signature, DispatchStatus> = HashMap::new();
        let mut accepted: Vec<TaskKey> = Vec::new();

        for task in tasks {
            let signature = task.signature;
            if &task.worker_id != worker_id {
                statuses.insert(
                    signature,
                    DispatchStatus::Rejected(format!("task targets worker {}", task.worker_id)),
                );
                continue;
            }
            let key = task.key();
            match self.queue.enqueue(task, listener) {
                Ok(EnqueueResult::Accepted) => accepted.push(key),
                Ok(EnqueueResult::AlreadyOutstanding(existing)) => {
                    statuses.insert(
                        signature,
                        DispatchStatus::Duplicate {
                            existing: existing.state,
                        },
                    );
                }
                Err(e) => {
                    statuses.insert(signature, DispatchStatus::Rejected(e.to_string()));
                }
            }
        }

        statuses.extend(self.ship(worker_id, accepted).await);

        order
            .into_iter()
            .map(|signature| TaskOutcome {
                signature,
                status: statuses.remove(&signature).unwrap_or(DispatchStatus::Skipped),
            })
            .collect()
    }

    /// Submit to several workers at once. Each worker's batches proceed
    /// independently, so a slow worker only delays its own tasks.
    ///
    /// Workers with fewer outstanding tasks queue for pool permits first.
    pub async fn submit_many(
        &self,
        batches: BTreeMap<WorkerId, Vec<Task>>,
        listener: Option<&Arc<CompletionLatch>>,
    ) -> BTreeMap<WorkerId, Vec<TaskOutcome>> {
        let mut batches: Vec<(usize, WorkerId, Vec<Task>)> = batches
            .into_iter()
            .map(|(worker_id, tasks)| (self.queue.count_outstanding(&worker_id), worker_id, tasks))
            .collect();
        batches.sort_by_key(|(outstanding, _, _)| *outstanding);

        let futures = batches.into_iter().map(|(_, worker_id, tasks)| async move {
            let outcomes = self.submit_batch(&worker_id, tasks, listener).await;
            (worker_id, outcomes)
        });
        join_all(futures).await.into_iter().collect()
    }

    /// Ship tasks that are already registered and Pending again, typically
    /// after a retry-reset.
    pub async fn resend(&self, worker_id: &WorkerId, keys: Vec<TaskKey>) -> Vec<TaskOutcome> {
        let order: Vec<Signature> = keys.iter().map(|k| k.signature).collect();
        let mut statuses = self.ship(worker_id, keys).await;
        order
            .into_iter()
            .map(|signature| TaskOutcome {
                signature,
                status: statuses.remove(&signature).unwrap_or(DispatchStatus::Skipped),
            })
            .collect()
    }

    async fn ship(
        &self,
        worker_id: &WorkerId,
        keys: Vec<TaskKey>,
    ) -> HashMap<Signature, DispatchStatus> {
        let mut statuses = HashMap::new();
        let slots = self.worker_slots(worker_id);

        for chunk in keys.chunks(self.max_tasks_per_batch) {
            // Worker slot first, so a stalled worker does not sit on pool
            // permits while its own batches queue up.
            let permits = match slots.acquire().await {
                Ok(worker) => self.pool.acquire().await.map(|pool| (worker, pool)),
                Err(e) => Err(e),
            };
            let Ok(_permits) = permits else {
                let err =
                    TransportError::Unreachable(worker_id.clone(), "dispatch pool closed".into());
                statuses.extend(self.fail_all(chunk, &err));
                continue;
            };

            // Anything resolved while we waited for the permit stays resolved.
            let batch: Vec<Task> = chunk.iter().filter_map(|k| self.queue.mark_sent(k)).collect();
            if batch.is_empty() {
                continue;
            }
            let sent_keys: Vec<TaskKey> = batch.iter().map(Task::key).collect();

            debug!(worker_id = %worker_id, tasks = batch.len(), "Submitting task batch");
            let result = match tokio::time::timeout(
                self.rpc_timeout,
                self.transport.submit(worker_id, batch),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(worker_id.clone())),
            };

            match result {
                Ok(outcome) => statuses.extend(self.apply_acks(&sent_keys, outcome)),
                Err(err) => {
                    warn!(
                        worker_id = %worker_id,
                        error = %err,
                        tasks = sent_keys.len(),
                        "Task batch submit failed"
                    );
                    statuses.extend(self.fail_all(&sent_keys, &err));
                }
            }
        }

        statuses
    }

    fn apply_acks(
        &self,
        keys: &[TaskKey],
        mut outcome: SubmitOutcome,
    ) -> Vec<(Signature, DispatchStatus)> {
        let mut finished = 0usize;
        let statuses: Vec<(Signature, DispatchStatus)> = keys
            .iter()
            .map(|key| {
                let ack = outcome
                    .acks
                    .remove(&key.signature)
                    .unwrap_or_else(|| TaskAck::Rejected("no acknowledgement".to_string()));
                let status = match ack {
                    TaskAck::Accepted => DispatchStatus::Sent,
                    TaskAck::Finished => {
                        // A heartbeat may already have reported it.
                        self.queue.complete(key, Resolution::Finished);
                        finished += 1;
                        DispatchStatus::Finished
                    }
                    TaskAck::Rejected(reason) => {
                        self.queue.complete(
                            key,
                            Resolution::Failed(FailureReason::Rejected(reason.clone())),
                        );
                        DispatchStatus::Rejected(reason)
                    }
                };
                (key.signature, status)
            })
            .collect();

        if let Some(first) = keys.first() {
            info!(
                worker_id = %first.worker_id,
                tasks = keys.len(),
                finished,
                "Task batch acknowledged"
            );
        }
        statuses
    }

    fn fail_all(&self, keys: &[TaskKey], err: &TransportError) -> Vec<(Signature, DispatchStatus)> {
        keys.iter()
            .map(|key| {
                self.queue.complete(
                    key,
                    Resolution::Failed(FailureReason::Transport(err.to_string())),
                );
                (key.signature, DispatchStatus::TransportFailed(err.clone()))
            })
            .collect()
    }
}
