//! TaskFleet Coordinator Library
//!
//! This crate provides the coordinator side of the agent task framework:
//! the sharded task queue, bounded dispatch to workers, heartbeat
//! reconciliation, the leader-only task runner, and build orchestration.

pub mod build;
pub mod config;
pub mod dispatch;
pub mod http;
pub mod latch;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod report;
pub mod sim;
pub mod state;
pub mod transport;

pub use build::{
    BuildError, BuildOrchestrator, BuildResult, BuildSpec, FailingReplica, ReplicaSpec,
    SubmissionMode,
};
pub use config::Config;
pub use dispatch::{DispatchExecutor, DispatchStatus, TaskOutcome};
pub use latch::{CompletionLatch, FailureReason, Resolution};
pub use leader::{JobError, LeaderError, LeaderLease, LeaderTaskRunner, MaintenanceJob, TaskHandle};
pub use queue::{spawn_expiry_sweeper, EnqueueResult, TaskQueue, TrackedTask};
pub use report::{ReportHandler, ReportSummary};
pub use sim::{SimulatedTransport, WorkerBehavior};
pub use state::AppState;
pub use transport::{AgentTransport, SubmitOutcome, TaskAck, TransportError, WorkerReport};
