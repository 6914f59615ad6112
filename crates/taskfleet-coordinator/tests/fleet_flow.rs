//! Metadata updates, heartbeat resends, expiry and leader jobs through a
//! fully wired coordinator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use taskfleet_coordinator::{
    spawn_expiry_sweeper, AppState, Config, DispatchStatus, JobError, LeaderError, LeaderLease,
    MaintenanceJob, SimulatedTransport, WorkerBehavior,
};
use taskfleet_core::{
    LeaderTaskStatus, Priority, TabletId, TabletMetaChange, TabletMetaUpdate, TaskPayload,
    TaskState, TaskType, WorkerId,
};

fn property_updates(count: u64) -> Vec<TabletMetaUpdate> {
    (0..count)
        .map(|i| {
            TabletMetaUpdate::new(
                TabletId::new(i),
                TabletMetaChange::Property {
                    key: "replication_num".to_string(),
                    value: i.to_string(),
                },
            )
        })
        .collect()
}

#[tokio::test]
async fn test_metadata_updates_ship_as_three_tasks() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::FinishImmediately));
    let config = Config {
        metadata_batch_size: 20,
        ..Config::default()
    };
    let state = AppState::new(config, transport.clone());
    let worker = WorkerId::new("w1");

    let factory = state.config.metadata_factory().unwrap();
    let tasks = factory.create(&worker, property_updates(50), &state.signatures);
    let sizes: Vec<usize> = tasks
        .iter()
        .map(|t| match &t.payload {
            TaskPayload::UpdateTabletMeta { updates } => updates.len(),
            other => panic!("unexpected payload {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![20, 20, 10]);

    let outcomes = state.dispatch.submit_batch(&worker, tasks, None).await;
    assert!(outcomes.iter().all(|o| o.status == DispatchStatus::Finished));
    // Three tasks fit in one RPC.
    assert_eq!(transport.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_lost_tasks_resent_from_heartbeat() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::AcceptAndForget));
    let config = Config {
        resend_after: Duration::from_secs(30),
        ..Config::default()
    };
    let state = AppState::new(config, transport.clone());
    let worker = WorkerId::new("w1");
    let tasks = state
        .config
        .metadata_factory()
        .unwrap()
        .create(&worker, property_updates(3), &state.signatures);
    state.dispatch.submit_batch(&worker, tasks, None).await;

    // Too early: nothing is resent.
    let summary = state.reports.handle(transport.take_report(&worker)).await;
    assert_eq!(summary.resent, 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    let summary = state.reports.handle(transport.take_report(&worker)).await;
    assert_eq!(summary.resent, 1);
    assert_eq!(transport.submit_count(), 2);

    let tracked = state.queue.snapshot(&worker, TaskType::UpdateTabletMeta);
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].task.state, TaskState::Sent);
    assert_eq!(tracked[0].task.attempt, 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_times_out_unanswered_tasks() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::AcceptAndForget));
    let config = Config {
        default_task_timeout: Duration::from_secs(5),
        sweep_interval: Duration::from_secs(1),
        ..Config::default()
    };
    let state = AppState::new(config, transport);
    let shutdown = CancellationToken::new();
    let sweeper = spawn_expiry_sweeper(
        state.queue.clone(),
        state.config.sweep_interval,
        shutdown.clone(),
    );

    let worker = WorkerId::new("w1");
    let tasks = state
        .config
        .metadata_factory()
        .unwrap()
        .create(&worker, property_updates(1), &state.signatures);
    state.dispatch.submit_batch(&worker, tasks, None).await;
    assert_eq!(state.queue.count_outstanding(&worker), 1);

    tokio::time::sleep(Duration::from_secs(7)).await;
    assert_eq!(state.queue.count_outstanding(&worker), 0);

    shutdown.cancel();
    sweeper.await.unwrap();
}

/// Counts its runs and holds until cancelled.
struct CompactionJob {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl MaintenanceJob for CompactionJob {
    fn identity(&self) -> String {
        "compaction".to_string()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), JobError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        cancel.cancelled().await;
        Err("cancelled".into())
    }
}

#[tokio::test]
async fn test_leader_job_cancelled_on_lease_loss() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::FinishImmediately));
    let state = AppState::new(Config::default(), transport);
    let runs = Arc::new(AtomicUsize::new(0));

    let job = Arc::new(CompactionJob { runs: runs.clone() });
    assert_eq!(
        state.leader.submit(job.clone(), Priority::NORMAL).err(),
        Some(LeaderError::NotLeader)
    );

    let lease = LeaderLease::new(3);
    let runner = state.leader.start(lease.clone()).unwrap();
    let mut handle = state.leader.submit(job, Priority::NORMAL).unwrap();
    while handle.status() != LeaderTaskStatus::Running {
        tokio::task::yield_now().await;
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    lease.revoke();
    runner.await.unwrap();
    assert_eq!(handle.wait().await, LeaderTaskStatus::Cancelled);
    assert!(!state.leader.is_leader());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_worker_does_not_stall_healthy_ones() {
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::FinishImmediately)
            .with_worker(WorkerId::new("stalled"), WorkerBehavior::NoAnswer),
    );
    let config = Config {
        max_dispatch_pool_size: 4,
        max_tasks_per_batch: 1,
        rpc_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    let state = AppState::new(config, transport);
    let factory = state.config.metadata_factory().unwrap();

    // More concurrent submits to the stalled worker than the pool has slots.
    let stalled = WorkerId::new("stalled");
    let blocked: Vec<_> = (0..6)
        .map(|_| {
            let state = state.clone();
            let stalled = stalled.clone();
            let tasks = factory.create(&stalled, property_updates(1), &state.signatures);
            tokio::spawn(async move { state.dispatch.submit_batch(&stalled, tasks, None).await })
        })
        .collect();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(state.dispatch.per_worker_limit(), 3);
    assert_eq!(state.dispatch.available_slots(), 1);

    let healthy = WorkerId::new("healthy");
    let tasks = factory.create(&healthy, property_updates(3), &state.signatures);
    let start = tokio::time::Instant::now();
    let outcomes = state.dispatch.submit_batch(&healthy, tasks, None).await;

    assert!(outcomes.iter().all(|o| o.status == DispatchStatus::Finished));
    assert!(start.elapsed() < Duration::from_secs(1));
    for handle in blocked {
        handle.abort();
    }
}

#[tokio::test]
async fn test_new_term_does_not_inherit_old_jobs() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::FinishImmediately));
    let state = AppState::new(Config::default(), transport);
    let runs = Arc::new(AtomicUsize::new(0));

    let first = LeaderLease::new(1);
    let old_loop = state.leader.start(first.clone()).unwrap();
    let mut handle = state
        .leader
        .submit(Arc::new(CompactionJob { runs: runs.clone() }), Priority::NORMAL)
        .unwrap();
    while handle.status() != LeaderTaskStatus::Running {
        tokio::task::yield_now().await;
    }

    // Leadership flips straight to the next term.
    first.revoke();
    state.leader.start(LeaderLease::new(2)).unwrap();
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }

    assert_eq!(handle.wait().await, LeaderTaskStatus::Cancelled);
    assert_eq!(state.leader.running_count(), 0);
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    old_loop.await.unwrap();
    assert!(state.leader.is_leader());
}
