//! End-to-end build scenarios against the simulated fleet.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use taskfleet_coordinator::{
    AppState, BuildResult, BuildSpec, Config, FailureReason, ReplicaSpec, SimulatedTransport,
    SubmissionMode, WorkerBehavior,
};
use taskfleet_core::{TabletId, WorkerId};

fn config() -> Config {
    Config {
        tablet_create_timeout: Duration::from_secs(5),
        rpc_timeout: Duration::from_secs(2),
        ..Config::default()
    }
}

fn spec(replicas: &[(&str, u64)]) -> BuildSpec {
    BuildSpec {
        replicas: replicas
            .iter()
            .map(|(w, t)| ReplicaSpec::new(WorkerId::new(*w), TabletId::new(*t)))
            .collect(),
        ..BuildSpec::default()
    }
}

/// Feed every worker's report to the coordinator once per `period`.
fn spawn_heartbeats(
    state: Arc<AppState>,
    transport: Arc<SimulatedTransport>,
    workers: Vec<WorkerId>,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(period).await;
            for worker in &workers {
                state.reports.handle(transport.take_report(worker)).await;
            }
        }
    })
}

fn workers(names: &[&str]) -> Vec<WorkerId> {
    names.iter().map(|n| WorkerId::new(*n)).collect()
}

#[tokio::test(start_paused = true)]
async fn test_one_silent_replica_yields_partial_failure() {
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::AcceptAndReport)
            .with_worker(WorkerId::new("w3"), WorkerBehavior::AcceptAndForget),
    );
    let state = AppState::new(config(), transport.clone());
    let heartbeats = spawn_heartbeats(
        state.clone(),
        transport,
        workers(&["w1", "w2", "w3"]),
        Duration::from_secs(1),
    );

    let start = Instant::now();
    let result = state
        .orchestrator
        .build(spec(&[("w1", 7), ("w2", 7), ("w3", 7)]))
        .await
        .unwrap();
    heartbeats.abort();

    assert!(start.elapsed() >= Duration::from_secs(5));
    let BuildResult::PartialFailure(failing) = result else {
        panic!("expected partial failure, got {result:?}");
    };
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].worker_id, WorkerId::new("w3"));
    assert_eq!(failing[0].tablet_id, TabletId::new(7));
    assert_eq!(failing[0].reason, FailureReason::TimedOut);

    // The timed-out member no longer counts as outstanding.
    assert_eq!(state.queue.count_outstanding(&WorkerId::new("w3")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_rpc_times_out_at_build_deadline() {
    // The RPC timeout is longer than the build deadline, so only the
    // deadline can resolve w3.
    let config = Config {
        tablet_create_timeout: Duration::from_secs(5),
        rpc_timeout: Duration::from_secs(10),
        ..Config::default()
    };
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::FinishImmediately)
            .with_worker(WorkerId::new("w3"), WorkerBehavior::NoAnswer),
    );
    let state = AppState::new(config, transport);

    let start = Instant::now();
    let result = state
        .orchestrator
        .build(spec(&[("w1", 9), ("w2", 9), ("w3", 9)]))
        .await
        .unwrap();

    assert!(start.elapsed() >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(6));
    let BuildResult::PartialFailure(failing) = result else {
        panic!("expected partial failure, got {result:?}");
    };
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].worker_id, WorkerId::new("w3"));
    assert_eq!(failing[0].tablet_id, TabletId::new(9));
    assert_eq!(failing[0].reason, FailureReason::TimedOut);
    assert_eq!(state.queue.count_outstanding(&WorkerId::new("w3")), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_submission_bounded_by_deadline() {
    let config = Config {
        tablet_create_timeout: Duration::from_secs(5),
        rpc_timeout: Duration::from_secs(60),
        ..Config::default()
    };
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::FinishImmediately)
            .with_worker(WorkerId::new("w2"), WorkerBehavior::NoAnswer),
    );
    let state = AppState::new(config, transport);
    let mut spec = spec(&[("w1", 1), ("w2", 1), ("w1", 2)]);
    spec.mode = SubmissionMode::Sequential;

    let start = Instant::now();
    let result = state.orchestrator.build(spec).await.unwrap();

    // Two tablets give a 10s deadline, well short of the RPC timeout.
    assert!(start.elapsed() >= Duration::from_secs(10));
    assert!(start.elapsed() < Duration::from_secs(11));
    let BuildResult::PartialFailure(failing) = result else {
        panic!("expected partial failure, got {result:?}");
    };
    let reasons: Vec<(&str, u64, FailureReason)> = failing
        .iter()
        .map(|f| (f.worker_id.as_str(), f.tablet_id.value(), f.reason.clone()))
        .collect();
    assert_eq!(
        reasons,
        vec![
            ("w1", 2, FailureReason::NotSubmitted),
            ("w2", 1, FailureReason::TimedOut),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reported_completion_succeeds_before_deadline() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::AcceptAndReport));
    let state = AppState::new(config(), transport.clone());
    let heartbeats = spawn_heartbeats(
        state.clone(),
        transport,
        workers(&["w1", "w2"]),
        Duration::from_secs(1),
    );

    let start = Instant::now();
    let result = state
        .orchestrator
        .build(spec(&[("w1", 1), ("w2", 1), ("w1", 2), ("w2", 2)]))
        .await
        .unwrap();
    heartbeats.abort();

    assert_eq!(result, BuildResult::Success);
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_mixed_fleet_reports_each_failure() {
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::FinishImmediately)
            .with_worker(WorkerId::new("w2"), WorkerBehavior::Unreachable)
            .with_worker(WorkerId::new("w3"), WorkerBehavior::Reject("disk full".into())),
    );
    let state = AppState::new(config(), transport);

    let result = state
        .orchestrator
        .build(spec(&[("w1", 1), ("w2", 1), ("w3", 1)]))
        .await
        .unwrap();

    let BuildResult::PartialFailure(failing) = result else {
        panic!("expected partial failure, got {result:?}");
    };
    let workers: Vec<&str> = failing.iter().map(|f| f.worker_id.as_str()).collect();
    assert_eq!(workers, vec!["w2", "w3"]);
    assert!(matches!(failing[0].reason, FailureReason::Transport(_)));
    assert_eq!(failing[1].reason, FailureReason::Rejected("disk full".into()));
}

#[tokio::test(start_paused = true)]
async fn test_hung_rpc_fails_at_rpc_timeout() {
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::FinishImmediately)
            .with_worker(WorkerId::new("w2"), WorkerBehavior::NoAnswer),
    );
    let state = AppState::new(config(), transport);

    let start = Instant::now();
    let result = state
        .orchestrator
        .build(spec(&[("w1", 1), ("w2", 1)]))
        .await
        .unwrap();

    // The RPC timeout resolves the member well before the build deadline.
    assert!(start.elapsed() < Duration::from_secs(5));
    let BuildResult::PartialFailure(failing) = result else {
        panic!("expected partial failure, got {result:?}");
    };
    assert_eq!(failing.len(), 1);
    assert!(matches!(failing[0].reason, FailureReason::Transport(_)));
}

#[tokio::test(start_paused = true)]
async fn test_silent_fleet_times_out_without_resolution() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::AcceptAndForget));
    let state = AppState::new(config(), transport);

    let result = state
        .orchestrator
        .build(spec(&[("w1", 3), ("w2", 3)]))
        .await
        .unwrap();

    assert_eq!(
        result,
        BuildResult::Timeout(vec![
            (WorkerId::new("w1"), TabletId::new(3)),
            (WorkerId::new("w2"), TabletId::new(3)),
        ])
    );
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_returns_on_first_failure() {
    let transport = Arc::new(
        SimulatedTransport::new(WorkerBehavior::AcceptAndForget)
            .with_worker(WorkerId::new("w2"), WorkerBehavior::Reject("bad schema".into())),
    );
    let state = AppState::new(config(), transport);
    let mut spec = spec(&[("w1", 1), ("w2", 1)]);
    spec.fail_fast = true;

    let start = Instant::now();
    let result = state.orchestrator.build(spec).await.unwrap();

    assert!(start.elapsed() < Duration::from_secs(1));
    let BuildResult::PartialFailure(failing) = result else {
        panic!("expected partial failure, got {result:?}");
    };
    assert_eq!(failing.len(), 1);
    assert_eq!(failing[0].worker_id, WorkerId::new("w2"));
    // The other replica is left running.
    assert_eq!(state.queue.count_outstanding(&WorkerId::new("w1")), 1);
}

#[tokio::test(start_paused = true)]
async fn test_dropping_build_leaves_tasks_tracked() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::AcceptAndReport));
    let state = AppState::new(config(), transport.clone());

    let aborted = tokio::time::timeout(
        Duration::from_secs(1),
        state.orchestrator.build(spec(&[("w1", 1), ("w2", 1)])),
    )
    .await;
    assert!(aborted.is_err());

    let w1 = WorkerId::new("w1");
    assert_eq!(state.queue.count_outstanding(&w1), 1);

    // Completion still reconciles after the waiter is gone.
    let summary = state.reports.handle(transport.take_report(&w1)).await;
    assert_eq!(summary.finished, 1);
    assert_eq!(state.queue.count_outstanding(&w1), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sequential_mode_waits_per_tablet() {
    let transport = Arc::new(SimulatedTransport::new(WorkerBehavior::AcceptAndReport));
    let state = AppState::new(config(), transport.clone());
    let heartbeats = spawn_heartbeats(
        state.clone(),
        transport.clone(),
        workers(&["w1", "w2"]),
        Duration::from_secs(1),
    );
    let mut spec = spec(&[("w1", 1), ("w2", 1), ("w1", 2), ("w2", 2)]);
    spec.mode = SubmissionMode::Sequential;

    let start = Instant::now();
    let result = state.orchestrator.build(spec).await.unwrap();
    heartbeats.abort();

    assert_eq!(result, BuildResult::Success);
    // Tablet 2 is only submitted after tablet 1's report, so it needs a
    // second heartbeat.
    assert!(start.elapsed() >= Duration::from_secs(2));
    assert_eq!(transport.submit_count(), 4);
}
