//! Multi-replica build orchestration.
//!
//! A build turns one logical operation ("create these replicas") into
//! CreateReplica tasks, ships them through the [`DispatchExecutor`], and
//! waits on a [`CompletionLatch`] until every member is resolved or the
//! aggregate deadline passes. Dropping the returned future stops waiting but
//! leaves the shipped tasks tracked in the queue.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use taskfleet_core::{
    BuildId, CreateReplicaConfig, RecoverySource, Signature, SignatureGenerator, StorageMedium,
    TabletId, TabletSchema, Task, TaskKey, TaskType, WorkerId,
};

use crate::config::Config;
use crate::dispatch::{DispatchExecutor, DispatchStatus, TaskOutcome};
use crate::latch::{CompletionLatch, FailureReason, Resolution};

/// How a build hands its tasks to the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubmissionMode {
    /// Submit every tablet's tasks up front and let the dispatch pool throttle.
    #[default]
    Concurrent,
    /// Submit one tablet at a time, waiting for each before the next.
    Sequential,
}

/// One replica to create.
#[derive(Debug, Clone)]
pub struct ReplicaSpec {
    pub worker_id: WorkerId,
    pub tablet_id: TabletId,
    pub storage_medium: StorageMedium,
    pub recovery_source: Option<RecoverySource>,
}

impl ReplicaSpec {
    pub fn new(worker_id: WorkerId, tablet_id: TabletId) -> Self {
        Self {
            worker_id,
            tablet_id,
            storage_medium: StorageMedium::Hdd,
            recovery_source: None,
        }
    }

    pub fn with_storage_medium(mut self, medium: StorageMedium) -> Self {
        self.storage_medium = medium;
        self
    }

    pub fn with_recovery_source(mut self, source: RecoverySource) -> Self {
        self.recovery_source = Some(source);
        self
    }
}

/// A build request.
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    pub replicas: Vec<ReplicaSpec>,
    pub schema: TabletSchema,
    pub mode: SubmissionMode,
    /// Return as soon as any member fails instead of waiting for the rest.
    pub fail_fast: bool,
}

/// A replica that did not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailingReplica {
    pub worker_id: WorkerId,
    pub tablet_id: TabletId,
    pub signature: Signature,
    pub reason: FailureReason,
}

/// Verdict of a build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "replicas", rename_all = "snake_case")]
pub enum BuildResult {
    /// Every replica finished.
    Success,
    /// Some replicas failed or never resolved, sorted by (worker, tablet).
    PartialFailure(Vec<FailingReplica>),
    /// The deadline passed before any replica resolved.
    Timeout(Vec<(WorkerId, TabletId)>),
}

impl BuildResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Invalid build requests.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("Build has no replicas")]
    EmptyBuild,

    #[error("Replica of tablet {tablet_id} on worker {worker_id} listed twice")]
    DuplicateReplica {
        worker_id: WorkerId,
        tablet_id: TabletId,
    },
}

struct Member {
    task: Task,
    tablet_id: TabletId,
}

/// Runs builds against the dispatcher.
pub struct BuildOrchestrator {
    config: Config,
    dispatch: Arc<DispatchExecutor>,
    signatures: Arc<SignatureGenerator>,
}

impl BuildOrchestrator {
    pub fn new(
        config: Config,
        dispatch: Arc<DispatchExecutor>,
        signatures: Arc<SignatureGenerator>,
    ) -> Self {
        Self {
            config,
            dispatch,
            signatures,
        }
    }

    /// Run a build to its verdict.
    pub async fn build(&self, spec: BuildSpec) -> Result<BuildResult, BuildError> {
        validate(&spec)?;

        let build_id = BuildId::generate();
        let tablets: BTreeSet<TabletId> = spec.replicas.iter().map(|r| r.tablet_id).collect();
        let timeout = self.config.build_timeout(tablets.len());
        let deadline = Instant::now() + timeout;
        let latch = Arc::new(CompletionLatch::new());

        // The aggregate deadline governs; member tasks get the same budget so
        // the expiry sweep does not cut them short.
        let members: Vec<Member> = spec
            .replicas
            .iter()
            .map(|replica| {
                let signature = self.signatures.next_signature();
                let task = Task::create_replica(
                    signature,
                    CreateReplicaConfig {
                        worker_id: replica.worker_id.clone(),
                        tablet_id: replica.tablet_id,
                        schema: spec.schema.clone(),
                        storage_medium: replica.storage_medium,
                        recovery_source: replica.recovery_source.clone(),
                        timeout,
                    },
                );
                latch.add_member(replica.worker_id.clone(), signature, Some(replica.tablet_id));
                Member {
                    task,
                    tablet_id: replica.tablet_id,
                }
            })
            .collect();

        info!(
            build_id = %build_id,
            replicas = members.len(),
            tablets = tablets.len(),
            timeout_ms = timeout.as_millis() as u64,
            mode = ?spec.mode,
            "Starting build"
        );

        // Submission counts against the deadline too. Members still in flight
        // when it passes are timed out below.
        match spec.mode {
            SubmissionMode::Concurrent => {
                let submission = self.submit(members.iter().map(|m| m.task.clone()), &latch);
                if tokio::time::timeout_at(deadline, submission).await.is_err() {
                    warn!(build_id = %build_id, "Build deadline elapsed during submission");
                }
            }
            SubmissionMode::Sequential => {
                self.submit_sequential(&members, &latch, deadline, spec.fail_fast)
                    .await;
            }
        }

        let fail_fast = spec.fail_fast;
        let completed = latch
            .wait_until(deadline, |s| s.all_resolved() || (fail_fast && s.has_failure()))
            .await;

        let result = if completed {
            verdict(&latch)
        } else {
            self.on_deadline(&build_id, &latch)
        };

        match &result {
            BuildResult::Success => info!(build_id = %build_id, "Build succeeded"),
            BuildResult::PartialFailure(failing) => {
                warn!(build_id = %build_id, failing = failing.len(), "Build partially failed")
            }
            BuildResult::Timeout(pending) => {
                warn!(build_id = %build_id, unresolved = pending.len(), "Build timed out")
            }
        }
        Ok(result)
    }

    /// Submit tasks grouped per worker and fold the outcomes into the latch.
    async fn submit(&self, tasks: impl Iterator<Item = Task>, latch: &Arc<CompletionLatch>) {
        let mut batches: BTreeMap<WorkerId, Vec<Task>> = BTreeMap::new();
        for task in tasks {
            batches.entry(task.worker_id.clone()).or_default().push(task);
        }
        let outcomes = self.dispatch.submit_many(batches, Some(latch)).await;
        for (worker_id, outcomes) in outcomes {
            for outcome in outcomes {
                record_outcome(latch, &worker_id, outcome);
            }
        }
    }

    async fn submit_sequential(
        &self,
        members: &[Member],
        latch: &Arc<CompletionLatch>,
        deadline: Instant,
        fail_fast: bool,
    ) {
        let mut order: Vec<TabletId> = Vec::new();
        for member in members {
            if !order.contains(&member.tablet_id) {
                order.push(member.tablet_id);
            }
        }

        let mut submitted: HashSet<TabletId> = HashSet::new();
        for tablet_id in order {
            let group: Vec<&Member> = members.iter().filter(|m| m.tablet_id == tablet_id).collect();
            let keys: Vec<(WorkerId, Signature)> = group
                .iter()
                .map(|m| (m.task.worker_id.clone(), m.task.signature))
                .collect();

            let submission = self.submit(group.iter().map(|m| m.task.clone()), latch);
            let shipped = tokio::time::timeout_at(deadline, submission).await;
            submitted.insert(tablet_id);
            if shipped.is_err() {
                break;
            }

            let settled = latch
                .wait_until(deadline, |s| {
                    s.resolved_all_of(&keys) || (fail_fast && s.has_failure())
                })
                .await;
            if !settled || latch.with_state(|s| s.has_failure()) {
                break;
            }
        }

        for member in members.iter().filter(|m| !submitted.contains(&m.tablet_id)) {
            latch.resolve(
                &member.task.worker_id,
                member.task.signature,
                Resolution::Failed(FailureReason::NotSubmitted),
            );
        }
    }

    /// Deadline passed with members unresolved. They are dropped from the
    /// queue as TimedOut so late reports are treated as stale.
    fn on_deadline(&self, build_id: &BuildId, latch: &CompletionLatch) -> BuildResult {
        let nothing_resolved = latch.with_state(|s| s.none_resolved());
        let unresolved: Vec<(WorkerId, Signature, Option<TabletId>)> = latch
            .members()
            .into_iter()
            .filter(|m| m.resolution.is_none())
            .map(|m| (m.worker_id, m.signature, m.tablet_id))
            .collect();

        let queue = self.dispatch.queue();
        for (worker_id, signature, _) in &unresolved {
            let key = TaskKey {
                worker_id: worker_id.clone(),
                task_type: TaskType::CreateReplica,
                signature: *signature,
            };
            if queue
                .complete(&key, Resolution::Failed(FailureReason::TimedOut))
                .is_none()
            {
                // Not in the queue; resolve the member directly.
                latch.resolve(worker_id, *signature, Resolution::Failed(FailureReason::TimedOut));
            }
        }
        warn!(build_id = %build_id, unresolved = unresolved.len(), "Build deadline elapsed");

        if nothing_resolved {
            let mut pending: Vec<(WorkerId, TabletId)> = unresolved
                .into_iter()
                .filter_map(|(worker_id, _, tablet_id)| tablet_id.map(|t| (worker_id, t)))
                .collect();
            pending.sort();
            return BuildResult::Timeout(pending);
        }
        verdict(latch)
    }
}

fn validate(spec: &BuildSpec) -> Result<(), BuildError> {
    if spec.replicas.is_empty() {
        return Err(BuildError::EmptyBuild);
    }
    let mut seen = HashSet::new();
    for replica in &spec.replicas {
        if !seen.insert((&replica.worker_id, replica.tablet_id)) {
            return Err(BuildError::DuplicateReplica {
                worker_id: replica.worker_id.clone(),
                tablet_id: replica.tablet_id,
            });
        }
    }
    Ok(())
}

/// Resolve the member for outcomes the queue did not resolve itself.
fn record_outcome(latch: &CompletionLatch, worker_id: &WorkerId, outcome: TaskOutcome) {
    let resolution = match outcome.status {
        DispatchStatus::Sent | DispatchStatus::Skipped => return,
        DispatchStatus::Finished => Resolution::Finished,
        DispatchStatus::Duplicate { .. } => Resolution::Failed(FailureReason::Duplicate),
        DispatchStatus::Rejected(reason) => Resolution::Failed(FailureReason::Rejected(reason)),
        DispatchStatus::TransportFailed(err) => {
            Resolution::Failed(FailureReason::Transport(err.to_string()))
        }
    };
    // A no-op when the queue already resolved it.
    latch.resolve(worker_id, outcome.signature, resolution);
}

/// Verdict over resolved members. Unresolved members are left out; they only
/// remain after a fail-fast return.
fn verdict(latch: &CompletionLatch) -> BuildResult {
    let mut failing: Vec<FailingReplica> = latch
        .members()
        .into_iter()
        .filter_map(|m| match (m.resolution, m.tablet_id) {
            (Some(Resolution::Failed(reason)), Some(tablet_id)) => Some(FailingReplica {
                worker_id: m.worker_id,
                tablet_id,
                signature: m.signature,
                reason,
            }),
            _ => None,
        })
        .collect();

    if failing.is_empty() {
        return BuildResult::Success;
    }
    failing.sort_by(|a, b| (&a.worker_id, a.tablet_id).cmp(&(&b.worker_id, b.tablet_id)));
    BuildResult::PartialFailure(failing)
}
