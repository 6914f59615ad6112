//! Leader-only priority task runner.
//!
//! Maintenance jobs run on the coordinator itself, and only while this node
//! holds a [`LeaderLease`]. A single dispatch loop pops jobs by priority (FIFO
//! within a priority) and spawns them while fewer than `leader_max_running`
//! are executing. Revoking the lease cancels every queued and running job and
//! stops dispatching until the runner is started with a new lease.
//!
//! Cancelling or timing out a job only stops the runner from tracking it. The
//! job's own code is expected to watch the [`CancellationToken`] it was given.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskfleet_core::{LeaderTaskStatus, Priority};

use crate::config::Config;

/// Error returned by a maintenance job.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

/// Work that only the leader may run.
#[async_trait]
pub trait MaintenanceJob: Send + Sync + 'static {
    /// Identity used to reject duplicate submissions.
    fn identity(&self) -> String;

    /// Run the job. `cancel` fires when the runner stops tracking it.
    async fn run(&self, cancel: CancellationToken) -> Result<(), JobError>;
}

/// Leader runner errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LeaderError {
    #[error("Not the leader")]
    NotLeader,

    #[error("Task already queued or running: {0}")]
    AlreadySubmitted(String),

    #[error("Runner already started for term {0}")]
    AlreadyStarted(u64),
}

/// Capability token proving leadership for one term.
///
/// Whoever decides leadership revokes the lease on loss.
#[derive(Debug, Clone)]
pub struct LeaderLease {
    term: u64,
    token: CancellationToken,
}

impl LeaderLease {
    pub fn new(term: u64) -> Self {
        Self {
            term,
            token: CancellationToken::new(),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn is_held(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Give up leadership.
    pub fn revoke(&self) {
        self.token.cancel();
    }

    /// Resolves once the lease is revoked.
    pub async fn revoked(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, PartialEq, Eq)]
struct QueuedEntry {
    priority: Priority,
    seq: u64,
    identity: String,
}

impl Ord for QueuedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: higher priority first, then lower sequence first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Entry {
    seq: u64,
    job: Arc<dyn MaintenanceJob>,
    status: watch::Sender<LeaderTaskStatus>,
    cancel: CancellationToken,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl Entry {
    fn current(&self) -> LeaderTaskStatus {
        *self.status.borrow()
    }
}

#[derive(Default)]
struct RunnerState {
    lease: Option<LeaderLease>,
    next_seq: u64,
    queue: BinaryHeap<QueuedEntry>,
    /// Live (Queued or Running) entries by identity.
    entries: HashMap<String, Entry>,
    running: usize,
}

impl RunnerState {
    fn is_leader(&self) -> bool {
        self.lease.as_ref().is_some_and(LeaderLease::is_held)
    }

    /// Move a live entry to a terminal status and forget it.
    fn retire(&mut self, identity: &str, seq: u64, status: LeaderTaskStatus) -> bool {
        match self.entries.get(identity) {
            Some(entry) if entry.seq == seq => {}
            _ => return false,
        }
        let Some(entry) = self.entries.remove(identity) else {
            return false;
        };
        if entry.current() == LeaderTaskStatus::Running {
            self.running -= 1;
        }
        if status != LeaderTaskStatus::Done {
            entry.cancel.cancel();
        }
        entry.status.send_replace(status);
        true
    }

    /// Drop the lease and cancel every queued and running entry.
    fn cancel_all(&mut self) -> usize {
        self.lease = None;
        self.queue.clear();
        let entries: Vec<(String, u64)> =
            self.entries.iter().map(|(id, e)| (id.clone(), e.seq)).collect();
        for (identity, seq) in &entries {
            self.retire(identity, *seq, LeaderTaskStatus::Cancelled);
        }
        entries.len()
    }
}

struct RunnerInner {
    state: Mutex<RunnerState>,
    wake: Notify,
    max_running: usize,
    default_timeout: Duration,
    sweep_interval: Duration,
}

impl RunnerInner {
    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start as many queued jobs as there are free slots.
    fn dispatch_ready(self: &Arc<Self>) {
        let mut started = Vec::new();
        {
            let mut state = self.lock();
            if !state.is_leader() {
                return;
            }
            while state.running < self.max_running {
                let Some(next) = state.queue.pop() else {
                    break;
                };
                let Some(entry) = state.entries.get_mut(&next.identity) else {
                    continue;
                };
                if entry.seq != next.seq || entry.current() != LeaderTaskStatus::Queued {
                    continue;
                }
                entry.deadline = Some(Instant::now() + entry.timeout);
                entry.status.send_replace(LeaderTaskStatus::Running);
                started.push((next.identity, entry.seq, entry.job.clone(), entry.cancel.clone()));
                state.running += 1;
            }
        }

        for (identity, seq, job, cancel) in started {
            debug!(identity = %identity, "Starting leader task");
            let inner = self.clone();
            tokio::spawn(async move {
                let result = job.run(cancel).await;
                inner.finish(&identity, seq, result);
            });
        }
    }

    fn finish(&self, identity: &str, seq: u64, result: Result<(), JobError>) {
        let status = match &result {
            Ok(()) => LeaderTaskStatus::Done,
            Err(_) => LeaderTaskStatus::Failed,
        };
        let retired = {
            let mut state = self.lock();
            let running = state
                .entries
                .get(identity)
                .is_some_and(|e| e.seq == seq && e.current() == LeaderTaskStatus::Running);
            running && state.retire(identity, seq, status)
        };
        match (retired, result) {
            (true, Ok(())) => info!(identity = %identity, "Leader task done"),
            (true, Err(e)) => warn!(identity = %identity, error = %e, "Leader task failed"),
            // Timed out or cancelled earlier; the late result is dropped.
            (false, _) => debug!(identity = %identity, "Ignoring result of untracked leader task"),
        }
        self.wake.notify_one();
    }

    /// Fail running jobs that are past their deadline.
    fn sweep(&self, now: Instant) {
        let expired: Vec<String> = {
            let mut state = self.lock();
            let overdue: Vec<(String, u64)> = state
                .entries
                .iter()
                .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
                .filter(|(_, e)| e.current() == LeaderTaskStatus::Running)
                .map(|(id, e)| (id.clone(), e.seq))
                .collect();
            overdue
                .into_iter()
                .filter(|(id, seq)| state.retire(id, *seq, LeaderTaskStatus::Failed))
                .map(|(id, _)| id)
                .collect()
        };
        for identity in &expired {
            warn!(identity = %identity, "Leader task exceeded its deadline");
        }
        if !expired.is_empty() {
            self.wake.notify_one();
        }
    }

    /// Cancel everything if `lease` is still the current one.
    fn on_leadership_lost(&self, lease: &LeaderLease) {
        let cancelled = {
            let mut state = self.lock();
            if state.lease.as_ref().map(LeaderLease::term) != Some(lease.term()) {
                // A newer term already cancelled this one's entries.
                return;
            }
            state.cancel_all()
        };
        warn!(term = lease.term(), cancelled, "Leadership lost, cancelled leader tasks");
    }
}

/// Priority runner for leader-only jobs.
#[derive(Clone)]
pub struct LeaderTaskRunner {
    inner: Arc<RunnerInner>,
}

impl LeaderTaskRunner {
    /// Create an idle runner. Nothing runs until [`LeaderTaskRunner::start`].
    pub fn new(config: &Config) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                state: Mutex::new(RunnerState::default()),
                wake: Notify::new(),
                max_running: config.leader_max_running.max(1),
                default_timeout: config.leader_task_timeout,
                sweep_interval: config.sweep_interval,
            }),
        }
    }

    /// Begin dispatching under `lease`. The loop exits when the lease is
    /// revoked.
    ///
    /// Entries left over from a revoked term are cancelled here if that
    /// term's loop has not done so yet; they never carry into the new term.
    pub fn start(&self, lease: LeaderLease) -> Result<JoinHandle<()>, LeaderError> {
        {
            let mut state = self.inner.lock();
            let stale_term = match state.lease.as_ref() {
                Some(current) if current.is_held() => {
                    return Err(LeaderError::AlreadyStarted(current.term()));
                }
                Some(stale) => Some(stale.term()),
                None => None,
            };
            if let Some(term) = stale_term {
                let cancelled = state.cancel_all();
                warn!(term, cancelled, "Leadership lost, cancelled leader tasks");
            }
            state.lease = Some(lease.clone());
        }
        info!(term = lease.term(), "Leader task runner started");

        let inner = self.inner.clone();
        Ok(tokio::spawn(async move {
            let mut sweep = tokio::time::interval(inner.sweep_interval);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = lease.revoked() => {
                        inner.on_leadership_lost(&lease);
                        break;
                    }
                    _ = inner.wake.notified() => {}
                    _ = sweep.tick() => inner.sweep(Instant::now()),
                }
                inner.dispatch_ready();
            }
        }))
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().is_leader()
    }

    /// Submit a job with the default deadline.
    pub fn submit(
        &self,
        job: Arc<dyn MaintenanceJob>,
        priority: Priority,
    ) -> Result<TaskHandle, LeaderError> {
        self.submit_with_timeout(job, priority, self.inner.default_timeout)
    }

    /// Submit a job that fails if it runs longer than `timeout`.
    pub fn submit_with_timeout(
        &self,
        job: Arc<dyn MaintenanceJob>,
        priority: Priority,
        timeout: Duration,
    ) -> Result<TaskHandle, LeaderError> {
        let identity = job.identity();
        let handle = {
            let mut state = self.inner.lock();
            if !state.is_leader() {
                return Err(LeaderError::NotLeader);
            }
            if state.entries.contains_key(&identity) {
                return Err(LeaderError::AlreadySubmitted(identity));
            }

            let seq = state.next_seq;
            state.next_seq += 1;
            let (status, status_rx) = watch::channel(LeaderTaskStatus::Queued);
            state.entries.insert(
                identity.clone(),
                Entry {
                    seq,
                    job,
                    status,
                    cancel: CancellationToken::new(),
                    timeout,
                    deadline: None,
                },
            );
            state.queue.push(QueuedEntry {
                priority,
                seq,
                identity: identity.clone(),
            });

            TaskHandle {
                identity,
                seq,
                status: status_rx,
                runner: Arc::downgrade(&self.inner),
            }
        };
        debug!(identity = %handle.identity, priority = priority.0, "Leader task queued");
        self.inner.wake.notify_one();
        Ok(handle)
    }

    /// Jobs waiting for a slot.
    pub fn queued_count(&self) -> usize {
        let state = self.inner.lock();
        state.entries.len() - state.running
    }

    /// Jobs currently executing.
    pub fn running_count(&self) -> usize {
        self.inner.lock().running
    }
}

/// Caller's view of a submitted leader job.
pub struct TaskHandle {
    identity: String,
    seq: u64,
    status: watch::Receiver<LeaderTaskStatus>,
    runner: Weak<RunnerInner>,
}

impl TaskHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn status(&self) -> LeaderTaskStatus {
        *self.status.borrow()
    }

    /// Cancel the job if it is still queued or running.
    pub fn cancel(&self) -> bool {
        let Some(runner) = self.runner.upgrade() else {
            return false;
        };
        let cancelled = runner
            .lock()
            .retire(&self.identity, self.seq, LeaderTaskStatus::Cancelled);
        if cancelled {
            warn!(identity = %self.identity, "Leader task cancelled");
            runner.wake.notify_one();
        }
        cancelled
    }

    /// Wait for a terminal status.
    pub async fn wait(&mut self) -> LeaderTaskStatus {
        let reached = match self.status.wait_for(LeaderTaskStatus::is_terminal).await {
            Ok(status) => Some(*status),
            Err(_) => None,
        };
        reached.unwrap_or_else(|| *self.status.borrow())
    }
}
