//! Shared application state.

use std::sync::Arc;

use taskfleet_core::SignatureGenerator;

use crate::build::BuildOrchestrator;
use crate::config::Config;
use crate::dispatch::DispatchExecutor;
use crate::leader::LeaderTaskRunner;
use crate::queue::TaskQueue;
use crate::report::ReportHandler;
use crate::transport::AgentTransport;

/// Shared application state.
///
/// Every component is constructed here and handed to its dependents; there
/// are no process-wide singletons.
pub struct AppState {
    pub config: Config,

    /// Outstanding worker tasks.
    pub queue: Arc<TaskQueue>,

    /// Bounded RPC fan-out to workers.
    pub dispatch: Arc<DispatchExecutor>,

    /// Heartbeat report processing.
    pub reports: ReportHandler,

    /// Leader-only maintenance jobs.
    pub leader: LeaderTaskRunner,

    /// Multi-replica builds.
    pub orchestrator: BuildOrchestrator,

    /// Signature allocator shared by every task producer.
    pub signatures: Arc<SignatureGenerator>,
}

impl AppState {
    /// Create a new AppState wrapped in Arc.
    pub fn new(config: Config, transport: Arc<dyn AgentTransport>) -> Arc<Self> {
        let queue = Arc::new(TaskQueue::new());
        let dispatch = Arc::new(DispatchExecutor::new(&config, queue.clone(), transport));
        let signatures = Arc::new(SignatureGenerator::default());

        Arc::new(Self {
            reports: ReportHandler::new(&config, dispatch.clone()),
            leader: LeaderTaskRunner::new(&config),
            orchestrator: BuildOrchestrator::new(
                config.clone(),
                dispatch.clone(),
                signatures.clone(),
            ),
            config,
            queue,
            dispatch,
            signatures,
        })
    }
}
