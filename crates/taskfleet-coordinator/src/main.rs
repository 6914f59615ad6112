//! TaskFleet Coordinator
//!
//! Runs the coordinator against an in-process simulated worker fleet: one
//! replica build, a leader-only metadata sync job, and optionally the HTTP
//! diagnostics server until ctrl-c.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use taskfleet_coordinator::{
    http, spawn_expiry_sweeper, AppState, BuildSpec, Config, DispatchStatus, JobError,
    LeaderLease, MaintenanceJob, ReplicaSpec, SimulatedTransport, SubmissionMode, WorkerBehavior,
};
use taskfleet_core::{
    ColumnSpec, Priority, StorageMedium, TabletId, TabletMetaChange, TabletMetaUpdate,
    TabletSchema, WorkerId,
};

/// Build submission mode.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Concurrent,
    Sequential,
}

/// TaskFleet coordinator running against a simulated worker fleet.
#[derive(Parser, Debug)]
#[command(name = "taskfleet-coordinator", about = "TaskFleet coordinator demo")]
struct Args {
    /// Number of simulated workers
    #[arg(long, default_value = "3")]
    workers: usize,

    /// Number of tablets to build
    #[arg(long, default_value = "4")]
    tablets: u64,

    /// Replicas per tablet
    #[arg(long, default_value = "3")]
    replicas: usize,

    /// Build submission mode
    #[arg(long, value_enum, default_value = "concurrent")]
    mode: Mode,

    /// Return as soon as one replica fails
    #[arg(long)]
    fail_fast: bool,

    /// Maximum concurrent submit RPCs
    #[arg(long, default_value = "64")]
    pool_size: usize,

    /// Maximum tasks per worker per RPC
    #[arg(long, default_value = "1000")]
    batch_size: usize,

    /// Per-tablet base build timeout in seconds
    #[arg(long, default_value = "10")]
    tablet_timeout_secs: u64,

    /// Maximum aggregate build timeout in seconds
    #[arg(long, default_value = "600")]
    max_build_timeout_secs: u64,

    /// Heartbeat interval of the simulated workers in milliseconds
    #[arg(long, default_value = "500")]
    heartbeat_ms: u64,

    /// Index of a worker that accepts tasks but never reports them
    #[arg(long)]
    silent_worker: Option<usize>,

    /// Index of a worker that rejects every task
    #[arg(long)]
    rejecting_worker: Option<usize>,

    /// Keep serving HTTP diagnostics after the build until ctrl-c
    #[arg(long)]
    serve: bool,

    /// HTTP server address
    #[arg(long, default_value = "127.0.0.1:8030")]
    http_addr: String,
}

impl Args {
    fn config(&self) -> Config {
        Config {
            max_dispatch_pool_size: self.pool_size,
            max_tasks_per_batch: self.batch_size,
            tablet_create_timeout: Duration::from_secs(self.tablet_timeout_secs),
            max_build_timeout: Duration::from_secs(self.max_build_timeout_secs),
            http_bind_addr: self.http_addr.clone(),
            ..Config::default()
        }
    }

    fn worker_ids(&self) -> Vec<WorkerId> {
        (0..self.workers.max(1))
            .map(|i| WorkerId::new(format!("be-{i}")))
            .collect()
    }
}

/// Log a background task that panicked or was aborted. Returns whether it
/// exited cleanly.
fn check_background_exit(name: &str, result: Result<(), JoinError>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            error!(task = name, error = %e, "Background task ended abnormally");
            false
        }
    }
}

/// Leader job that pushes tablet property changes to the fleet.
struct TabletMetaSyncJob {
    state: Arc<AppState>,
    updates: Vec<(WorkerId, TabletMetaUpdate)>,
}

#[async_trait]
impl MaintenanceJob for TabletMetaSyncJob {
    fn identity(&self) -> String {
        "tablet-meta-sync".to_string()
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), JobError> {
        let factory = self.state.config.metadata_factory()?;
        let batches = factory.create_for_workers(self.updates.clone(), &self.state.signatures);
        let tasks: usize = batches.values().map(Vec::len).sum();
        info!(workers = batches.len(), tasks, "Syncing tablet metadata");

        let outcomes = tokio::select! {
            _ = cancel.cancelled() => return Err("cancelled".into()),
            outcomes = self.state.dispatch.submit_many(batches, None) => outcomes,
        };
        let failed = outcomes
            .values()
            .flatten()
            .filter(|o| !matches!(o.status, DispatchStatus::Sent | DispatchStatus::Finished))
            .count();
        if failed > 0 {
            return Err(format!("{failed} metadata tasks were not delivered").into());
        }
        Ok(())
    }
}

fn build_spec(args: &Args, workers: &[WorkerId]) -> BuildSpec {
    let replicas = args.replicas.clamp(1, workers.len());
    let mut spec = BuildSpec {
        schema: TabletSchema {
            schema_id: 1,
            schema_version: 1,
            short_key_column_count: 1,
            columns: vec![
                ColumnSpec::key("id", "BIGINT"),
                ColumnSpec::value("payload", "VARCHAR"),
            ],
        },
        mode: match args.mode {
            Mode::Concurrent => SubmissionMode::Concurrent,
            Mode::Sequential => SubmissionMode::Sequential,
        },
        fail_fast: args.fail_fast,
        ..BuildSpec::default()
    };
    for tablet in 0..args.tablets {
        for r in 0..replicas {
            let worker = &workers[(tablet as usize + r) % workers.len()];
            spec.replicas.push(
                ReplicaSpec::new(worker.clone(), TabletId::new(10_000 + tablet))
                    .with_storage_medium(StorageMedium::Ssd),
            );
        }
    }
    spec
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = args.config();
    let workers = args.worker_ids();

    let mut transport = SimulatedTransport::new(WorkerBehavior::AcceptAndReport);
    if let Some(worker) = args.silent_worker.and_then(|i| workers.get(i)) {
        transport = transport.with_worker(worker.clone(), WorkerBehavior::AcceptAndForget);
    }
    if let Some(worker) = args.rejecting_worker.and_then(|i| workers.get(i)) {
        transport = transport.with_worker(
            worker.clone(),
            WorkerBehavior::Reject("simulated rejection".to_string()),
        );
    }
    let transport = Arc::new(transport);
    let state = AppState::new(config, transport.clone());

    info!(
        workers = workers.len(),
        pool_size = state.dispatch.pool_size(),
        "Starting TaskFleet coordinator"
    );

    let shutdown = CancellationToken::new();
    let sweeper = spawn_expiry_sweeper(
        state.queue.clone(),
        state.config.sweep_interval,
        shutdown.clone(),
    );

    // Heartbeats from the simulated fleet
    let heartbeats = {
        let state = state.clone();
        let transport = transport.clone();
        let workers = workers.clone();
        let shutdown = shutdown.clone();
        let period = Duration::from_millis(args.heartbeat_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for worker in &workers {
                            state.reports.handle(transport.take_report(worker)).await;
                        }
                    }
                }
            }
        })
    };

    // This process is the only coordinator, so it leads from the start.
    let lease = LeaderLease::new(1);
    state.leader.start(lease.clone())?;
    let updates = workers
        .iter()
        .enumerate()
        .map(|(i, worker)| {
            (
                worker.clone(),
                TabletMetaUpdate::new(
                    TabletId::new(10_000 + i as u64),
                    TabletMetaChange::InMemory { enabled: true },
                ),
            )
        })
        .collect();
    let mut meta_sync = state.leader.submit(
        Arc::new(TabletMetaSyncJob {
            state: state.clone(),
            updates,
        }),
        Priority::HIGH,
    )?;

    let spec = build_spec(&args, &workers);
    let result = state.orchestrator.build(spec).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.is_success() {
        warn!("Build did not fully succeed");
    }

    let status = meta_sync.wait().await;
    info!(status = ?status, "Metadata sync finished");

    if args.serve {
        let http_addr = state.config.http_bind_addr.clone();
        let listener = TcpListener::bind(&http_addr).await?;
        info!("HTTP server listening on {}", http_addr);
        let router = http::create_router(state.clone());
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
        {
            error!(error = %e, "HTTP server error");
        }
    }

    lease.revoke();
    shutdown.cancel();
    let (sweeper, heartbeats) = tokio::join!(sweeper, heartbeats);
    check_background_exit("expiry sweeper", sweeper);
    check_background_exit("heartbeat loop", heartbeats);
    info!("TaskFleet coordinator stopped");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_panic_is_reported() {
        let clean = tokio::spawn(async {}).await;
        assert!(check_background_exit("clean", clean));

        let panicked = tokio::spawn(async { panic!("sweeper crashed") }).await;
        assert!(!check_background_exit("crashed", panicked));
    }
}
