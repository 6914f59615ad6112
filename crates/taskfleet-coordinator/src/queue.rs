//! Registry of outstanding agent tasks.
//!
//! Tasks are sharded by (worker, task type). The shard map is only locked to
//! find or lazily create a shard; every mutation then holds that shard's own
//! lock, so unrelated workers and task types never contend. Operations that
//! span shards (per-worker counts, the deadline sweep) visit shards one at a
//! time and may observe a transiently inconsistent view.
//!
//! A task leaves the queue the instant it reaches a terminal state. Removal
//! through [`TaskQueue::complete`] is a compare-and-set: whichever of the RPC
//! fast path, a heartbeat report or the deadline sweep gets there first wins,
//! and the others find nothing to do.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskfleet_core::{CoreError, Signature, Task, TaskKey, TaskState, TaskType, WorkerId};

use crate::latch::{CompletionLatch, FailureReason, Resolution};

/// Result of registering a task.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueResult {
    /// The task is now tracked.
    Accepted,
    /// A task with the same key is already outstanding; it is returned as is
    /// and nothing new was registered.
    AlreadyOutstanding(Task),
}

/// A task as held by the queue.
#[derive(Debug, Clone)]
pub struct TrackedTask {
    pub task: Task,
    pub enqueued_at: Instant,
    pub deadline: Instant,
    pub sent_at: Option<Instant>,
    seq: u64,
    listener: Option<Weak<CompletionLatch>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShardKey {
    worker_id: WorkerId,
    task_type: TaskType,
}

#[derive(Debug, Default)]
struct Shard {
    tasks: HashMap<Signature, TrackedTask>,
}

/// A terminal transition that still has to be reported to its listener.
struct Completed {
    task: Task,
    resolution: Resolution,
    listener: Option<Weak<CompletionLatch>>,
}

impl Completed {
    fn notify(self) -> Task {
        match &self.resolution {
            Resolution::Finished => debug!(
                worker_id = %self.task.worker_id,
                signature = %self.task.signature,
                task_type = ?self.task.task_type(),
                "Task finished"
            ),
            Resolution::Failed(reason) => warn!(
                worker_id = %self.task.worker_id,
                signature = %self.task.signature,
                task_type = ?self.task.task_type(),
                state = ?self.task.state,
                reason = ?reason,
                "Task did not finish"
            ),
        }
        if let Some(latch) = self.listener.and_then(|l| l.upgrade()) {
            latch.resolve(&self.task.worker_id, self.task.signature, self.resolution);
        }
        self.task
    }
}

/// Concurrent registry of outstanding tasks.
#[derive(Debug, Default)]
pub struct TaskQueue {
    shards: RwLock<HashMap<ShardKey, Arc<Mutex<Shard>>>>,
    next_seq: AtomicU64,
}

fn lock(shard: &Mutex<Shard>) -> MutexGuard<'_, Shard> {
    shard.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, worker_id: &WorkerId, task_type: TaskType) -> Option<Arc<Mutex<Shard>>> {
        let key = ShardKey {
            worker_id: worker_id.clone(),
            task_type,
        };
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()
    }

    fn shard_or_create(&self, worker_id: &WorkerId, task_type: TaskType) -> Arc<Mutex<Shard>> {
        if let Some(shard) = self.shard(worker_id, task_type) {
            return shard;
        }
        let key = ShardKey {
            worker_id: worker_id.clone(),
            task_type,
        };
        self.shards
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .clone()
    }

    fn all_shards(&self) -> Vec<(ShardKey, Arc<Mutex<Shard>>)> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Register a task. `listener` is resolved when the task reaches a
    /// terminal state; only a weak reference is kept, so dropping the latch
    /// detaches it.
    pub fn enqueue(
        &self,
        task: Task,
        listener: Option<&Arc<CompletionLatch>>,
    ) -> Result<EnqueueResult, CoreError> {
        if task.is_terminal() {
            return Err(CoreError::InvalidInput(format!(
                "task {} is already {:?}",
                task.signature, task.state
            )));
        }

        let shard = self.shard_or_create(&task.worker_id, task.task_type());
        let mut shard = lock(&shard);

        if let Some(existing) = shard.tasks.get(&task.signature) {
            debug!(
                worker_id = %task.worker_id,
                signature = %task.signature,
                "Task already outstanding"
            );
            return Ok(EnqueueResult::AlreadyOutstanding(existing.task.clone()));
        }

        let now = Instant::now();
        let tracked = TrackedTask {
            enqueued_at: now,
            deadline: now + task.timeout,
            sent_at: None,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            listener: listener.map(Arc::downgrade),
            task,
        };
        shard.tasks.insert(tracked.task.signature, tracked);
        Ok(EnqueueResult::Accepted)
    }

    /// Stop tracking a task without resolving it. Idempotent.
    pub fn remove(&self, worker_id: &WorkerId, task_type: TaskType, signature: Signature) -> bool {
        self.shard(worker_id, task_type)
            .map(|shard| lock(&shard).tasks.remove(&signature).is_some())
            .unwrap_or(false)
    }

    /// Move a task to its terminal state and drop it from the queue.
    ///
    /// Returns the final task, or `None` if it was no longer outstanding.
    pub fn complete(&self, key: &TaskKey, resolution: Resolution) -> Option<Task> {
        let shard = self.shard(&key.worker_id, key.task_type)?;
        let completed = {
            let mut shard = lock(&shard);
            let tracked = shard.tasks.remove(&key.signature)?;
            finish(tracked, resolution)
        };
        Some(completed.notify())
    }

    /// Transition a pending task to Sent, bumping its attempt counter.
    pub fn mark_sent(&self, key: &TaskKey) -> Option<Task> {
        let shard = self.shard(&key.worker_id, key.task_type)?;
        let mut shard = lock(&shard);
        let tracked = shard.tasks.get_mut(&key.signature)?;
        tracked.task.transition(TaskState::Sent).ok()?;
        tracked.task.attempt += 1;
        tracked.sent_at = Some(Instant::now());
        Some(tracked.task.clone())
    }

    /// Reset a Sent task back to Pending so it can be shipped again.
    pub fn reset_to_pending(&self, key: &TaskKey) -> Option<Task> {
        let shard = self.shard(&key.worker_id, key.task_type)?;
        let mut shard = lock(&shard);
        let tracked = shard.tasks.get_mut(&key.signature)?;
        if tracked.task.state != TaskState::Sent {
            return None;
        }
        tracked.task.transition(TaskState::Pending).ok()?;
        tracked.sent_at = None;
        Some(tracked.task.clone())
    }

    /// Apply a worker's finished list for one task type.
    ///
    /// Every outstanding task whose signature is in `finished` becomes
    /// Finished. Signatures the queue no longer tracks are stale (for example
    /// the coordinator already timed them out) and are ignored.
    pub fn reconcile(
        &self,
        worker_id: &WorkerId,
        task_type: TaskType,
        finished: &HashSet<Signature>,
    ) -> usize {
        let Some(shard) = self.shard(worker_id, task_type) else {
            if !finished.is_empty() {
                debug!(
                    worker_id = %worker_id,
                    task_type = ?task_type,
                    stale = finished.len(),
                    "Report for untracked shard"
                );
            }
            return 0;
        };

        let completed: Vec<Completed> = {
            let mut shard = lock(&shard);
            finished
                .iter()
                .filter_map(|sig| shard.tasks.remove(sig))
                .map(|tracked| finish(tracked, Resolution::Finished))
                .collect()
        };

        let removed = completed.len();
        let stale = finished.len() - removed;
        if stale > 0 {
            debug!(
                worker_id = %worker_id,
                task_type = ?task_type,
                stale,
                "Ignoring stale finished signatures"
            );
        }
        for c in completed {
            c.notify();
        }
        removed
    }

    /// Sent tasks the worker no longer reports as running and that were
    /// shipped at least `resend_after` ago. State is left untouched.
    pub fn diff(
        &self,
        worker_id: &WorkerId,
        task_type: TaskType,
        running: &HashSet<Signature>,
        resend_after: Duration,
    ) -> Vec<Task> {
        let Some(shard) = self.shard(worker_id, task_type) else {
            return Vec::new();
        };
        let now = Instant::now();
        let shard = lock(&shard);
        let mut stale: Vec<&TrackedTask> = shard
            .tasks
            .values()
            .filter(|t| t.task.state == TaskState::Sent && !running.contains(&t.task.signature))
            .filter(|t| t.sent_at.is_some_and(|at| now.duration_since(at) >= resend_after))
            .collect();
        stale.sort_by_key(|t| t.seq);
        stale.into_iter().map(|t| t.task.clone()).collect()
    }

    /// Outstanding tasks of one shard in registration order.
    pub fn snapshot(&self, worker_id: &WorkerId, task_type: TaskType) -> Vec<TrackedTask> {
        let Some(shard) = self.shard(worker_id, task_type) else {
            return Vec::new();
        };
        let mut tasks: Vec<TrackedTask> = lock(&shard).tasks.values().cloned().collect();
        tasks.sort_by_key(|t| t.seq);
        tasks
    }

    /// Look up a single outstanding task.
    pub fn get(&self, key: &TaskKey) -> Option<Task> {
        let shard = self.shard(&key.worker_id, key.task_type)?;
        let shard = lock(&shard);
        shard.tasks.get(&key.signature).map(|t| t.task.clone())
    }

    /// Outstanding tasks for a worker across all task types.
    pub fn count_outstanding(&self, worker_id: &WorkerId) -> usize {
        TaskType::ALL
            .iter()
            .filter_map(|t| self.shard(worker_id, *t))
            .map(|shard| lock(&shard).tasks.len())
            .sum()
    }

    /// Outstanding tasks per (type, state) across the whole queue.
    pub fn count_by_state(&self) -> BTreeMap<(TaskType, TaskState), usize> {
        let mut counts = BTreeMap::new();
        for (key, shard) in self.all_shards() {
            for tracked in lock(&shard).tasks.values() {
                *counts.entry((key.task_type, tracked.task.state)).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Workers that have ever had a shard.
    pub fn workers(&self) -> Vec<WorkerId> {
        let mut workers: Vec<WorkerId> = self
            .all_shards()
            .into_iter()
            .map(|(key, _)| key.worker_id)
            .collect();
        workers.sort();
        workers.dedup();
        workers
    }

    /// Time out every task whose deadline is at or before `now`.
    pub fn expire_overdue(&self, now: Instant) -> Vec<Task> {
        let mut expired = Vec::new();
        for (_, shard) in self.all_shards() {
            let completed: Vec<Completed> = {
                let mut shard = lock(&shard);
                let overdue: Vec<Signature> = shard
                    .tasks
                    .values()
                    .filter(|t| t.deadline <= now)
                    .map(|t| t.task.signature)
                    .collect();
                overdue
                    .iter()
                    .filter_map(|sig| shard.tasks.remove(sig))
                    .map(|tracked| finish(tracked, Resolution::Failed(FailureReason::TimedOut)))
                    .collect()
            };
            expired.extend(completed.into_iter().map(Completed::notify));
        }
        expired
    }
}

fn finish(mut tracked: TrackedTask, resolution: Resolution) -> Completed {
    // Outstanding -> terminal is always a legal transition.
    tracked.task.state = resolution.state();
    Completed {
        task: tracked.task,
        resolution,
        listener: tracked.listener,
    }
}

/// Run the deadline sweep every `interval` until `shutdown` fires.
pub fn spawn_expiry_sweeper(
    queue: Arc<TaskQueue>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = queue.expire_overdue(Instant::now());
                    if !expired.is_empty() {
                        info!(count = expired.len(), "Timed out overdue tasks");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskfleet_core::{TabletId, TaskPayload};

    fn drop_task(worker: &str, sig: u64) -> Task {
        Task::new(
            Signature::new(sig),
            WorkerId::new(worker),
            TaskPayload::DropReplica {
                tablet_id: TabletId::new(sig),
                force: false,
            },
            Duration::from_secs(10),
        )
    }

    fn key(worker: &str, sig: u64) -> TaskKey {
        drop_task(worker, sig).key()
    }

    fn sigs(values: &[u64]) -> HashSet<Signature> {
        values.iter().copied().map(Signature::new).collect()
    }

    #[test]
    fn test_duplicate_returns_existing_task() {
        let queue = TaskQueue::new();
        assert_eq!(
            queue.enqueue(drop_task("w1", 1), None).unwrap(),
            EnqueueResult::Accepted
        );
        queue.mark_sent(&key("w1", 1)).unwrap();

        let result = queue.enqueue(drop_task("w1", 1), None).unwrap();
        match result {
            EnqueueResult::AlreadyOutstanding(existing) => {
                assert_eq!(existing.state, TaskState::Sent);
                assert_eq!(existing.attempt, 1);
            }
            other => panic!("expected duplicate, got {:?}", other),
        }
        assert_eq!(queue.snapshot(&WorkerId::new("w1"), TaskType::DropReplica).len(), 1);
    }

    #[test]
    fn test_same_signature_on_other_worker_is_distinct() {
        let queue = TaskQueue::new();
        queue.enqueue(drop_task("w1", 1), None).unwrap();
        assert_eq!(
            queue.enqueue(drop_task("w2", 1), None).unwrap(),
            EnqueueResult::Accepted
        );
    }

    #[test]
    fn test_terminal_task_rejected() {
        let queue = TaskQueue::new();
        let mut task = drop_task("w1", 1);
        task.state = TaskState::Finished;
        assert!(queue.enqueue(task, None).is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let queue = TaskQueue::new();
        queue.enqueue(drop_task("w1", 1), None).unwrap();
        let worker = WorkerId::new("w1");
        assert!(queue.remove(&worker, TaskType::DropReplica, Signature::new(1)));
        assert!(!queue.remove(&worker, TaskType::DropReplica, Signature::new(1)));
        assert!(!queue.remove(&worker, TaskType::CreateReplica, Signature::new(1)));
    }

    #[test]
    fn test_reconcile_removes_exactly_reported() {
        let queue = TaskQueue::new();
        for sig in 1..=4 {
            queue.enqueue(drop_task("w1", sig), None).unwrap();
        }
        let worker = WorkerId::new("w1");

        let removed = queue.reconcile(&worker, TaskType::DropReplica, &sigs(&[2, 3, 99]));

        assert_eq!(removed, 2);
        let left: Vec<u64> = queue
            .snapshot(&worker, TaskType::DropReplica)
            .iter()
            .map(|t| t.task.signature.value())
            .collect();
        assert_eq!(left, vec![1, 4]);
    }

    #[test]
    fn test_reconcile_unknown_shard_is_noop() {
        let queue = TaskQueue::new();
        let removed = queue.reconcile(&WorkerId::new("ghost"), TaskType::SchemaChange, &sigs(&[1]));
        assert_eq!(removed, 0);
    }

    #[test]
    fn test_complete_only_once() {
        let queue = TaskQueue::new();
        queue.enqueue(drop_task("w1", 1), None).unwrap();

        let done = queue.complete(&key("w1", 1), Resolution::Finished).unwrap();
        assert_eq!(done.state, TaskState::Finished);
        assert!(queue
            .complete(&key("w1", 1), Resolution::Failed(FailureReason::TimedOut))
            .is_none());
    }

    #[test]
    fn test_complete_notifies_listener() {
        let queue = TaskQueue::new();
        let latch = Arc::new(CompletionLatch::new());
        latch.add_member(WorkerId::new("w1"), Signature::new(1), None);
        queue.enqueue(drop_task("w1", 1), Some(&latch)).unwrap();

        queue.complete(
            &key("w1", 1),
            Resolution::Failed(FailureReason::Rejected("no disk".into())),
        );

        assert!(latch.with_state(|s| s.all_resolved() && s.has_failure()));
    }

    #[test]
    fn test_dropped_listener_is_detached() {
        let queue = TaskQueue::new();
        let latch = Arc::new(CompletionLatch::new());
        queue.enqueue(drop_task("w1", 1), Some(&latch)).unwrap();
        drop(latch);

        assert!(queue.complete(&key("w1", 1), Resolution::Finished).is_some());
    }

    #[test]
    fn test_mark_sent_and_reset() {
        let queue = TaskQueue::new();
        queue.enqueue(drop_task("w1", 1), None).unwrap();

        let sent = queue.mark_sent(&key("w1", 1)).unwrap();
        assert_eq!(sent.state, TaskState::Sent);
        assert!(queue.mark_sent(&key("w1", 1)).is_none());

        let reset = queue.reset_to_pending(&key("w1", 1)).unwrap();
        assert_eq!(reset.state, TaskState::Pending);
        assert_eq!(reset.attempt, 1);
        assert!(queue.reset_to_pending(&key("w1", 1)).is_none());
    }

    #[test]
    fn test_count_outstanding_spans_types() {
        let queue = TaskQueue::new();
        queue.enqueue(drop_task("w1", 1), None).unwrap();
        queue.enqueue(drop_task("w1", 2), None).unwrap();
        queue
            .enqueue(
                Task::new(
                    Signature::new(3),
                    WorkerId::new("w1"),
                    TaskPayload::MaintenanceJob { name: "compact".into() },
                    Duration::from_secs(1),
                ),
                None,
            )
            .unwrap();
        queue.enqueue(drop_task("w2", 4), None).unwrap();

        assert_eq!(queue.count_outstanding(&WorkerId::new("w1")), 3);
        assert_eq!(queue.count_outstanding(&WorkerId::new("w2")), 1);
        assert_eq!(queue.count_outstanding(&WorkerId::new("w3")), 0);
        assert_eq!(queue.workers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_overdue() {
        let queue = TaskQueue::new();
        let mut short = drop_task("w1", 1);
        short.timeout = Duration::from_secs(1);
        queue.enqueue(short, None).unwrap();
        queue.enqueue(drop_task("w1", 2), None).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = queue.expire_overdue(Instant::now());

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].state, TaskState::TimedOut);
        assert_eq!(queue.count_outstanding(&WorkerId::new("w1")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_diff_returns_unreported_sent_tasks() {
        let queue = TaskQueue::new();
        for sig in 1..=3 {
            queue.enqueue(drop_task("w1", sig), None).unwrap();
        }
        queue.mark_sent(&key("w1", 1)).unwrap();
        queue.mark_sent(&key("w1", 2)).unwrap();

        let worker = WorkerId::new("w1");
        let resend_after = Duration::from_secs(60);
        let too_early = queue.diff(&worker, TaskType::DropReplica, &sigs(&[]), resend_after);
        assert!(too_early.is_empty());

        tokio::time::advance(Duration::from_secs(61)).await;
        let stale = queue.diff(&worker, TaskType::DropReplica, &sigs(&[2]), resend_after);
        let stale: Vec<u64> = stale.iter().map(|t| t.signature.value()).collect();
        assert_eq!(stale, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_on_shutdown() {
        let queue = Arc::new(TaskQueue::new());
        let mut task = drop_task("w1", 1);
        task.timeout = Duration::from_millis(500);
        queue.enqueue(task, None).unwrap();

        let shutdown = CancellationToken::new();
        let handle =
            spawn_expiry_sweeper(queue.clone(), Duration::from_millis(100), shutdown.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.count_outstanding(&WorkerId::new("w1")), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
