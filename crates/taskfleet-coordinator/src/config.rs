//! Coordinator configuration.

use std::time::Duration;

use taskfleet_core::{CoreError, MetadataUpdateTaskFactory, TaskPayload, TaskType};

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of concurrent RPCs the dispatch pool issues.
    pub max_dispatch_pool_size: usize,

    /// Maximum concurrent RPCs to a single worker. Always kept below the pool
    /// size so one worker cannot occupy every slot.
    pub max_inflight_per_worker: usize,

    /// Maximum number of tasks shipped to one worker in one RPC.
    pub max_tasks_per_batch: usize,

    /// Timeout of a single submit RPC.
    pub rpc_timeout: Duration,

    /// Base build time allowed per tablet.
    pub tablet_create_timeout: Duration,

    /// Hard cap on the aggregate build deadline.
    pub max_build_timeout: Duration,

    /// Base timeout for task types without a dedicated setting.
    pub default_task_timeout: Duration,

    /// Interval of the task and leader-runner deadline sweeps.
    pub sweep_interval: Duration,

    /// How long a Sent task may go unreported before it is resent.
    pub resend_after: Duration,

    /// Attempts after which an unreported task is failed instead of resent.
    pub max_resend_attempts: u32,

    /// Maximum metadata changes folded into one UpdateTabletMeta task.
    pub metadata_batch_size: usize,

    /// Maximum leader tasks executing at once.
    pub leader_max_running: usize,

    /// Deadline of a leader task that does not set its own.
    pub leader_task_timeout: Duration,

    /// HTTP diagnostics bind address.
    pub http_bind_addr: String,
}

impl Config {
    /// Timeout of a task with this payload, scaled by its tablet count where
    /// the work grows with it.
    pub fn task_timeout(&self, payload: &TaskPayload) -> Duration {
        match payload.task_type() {
            TaskType::CreateReplica => self.tablet_create_timeout,
            TaskType::UpdateTabletMeta => {
                let tablets = u32::try_from(payload.tablet_ids().len().max(1)).unwrap_or(u32::MAX);
                self.default_task_timeout
                    .saturating_mul(tablets)
                    .min(self.max_build_timeout)
            }
            _ => self.default_task_timeout,
        }
    }

    /// Aggregate deadline of a build over `tablet_count` tablets.
    pub fn build_timeout(&self, tablet_count: usize) -> Duration {
        let tablets = u32::try_from(tablet_count.max(1)).unwrap_or(u32::MAX);
        self.tablet_create_timeout
            .saturating_mul(tablets)
            .min(self.max_build_timeout)
    }

    /// Metadata task factory using this config's batch size and timeouts.
    pub fn metadata_factory(&self) -> Result<MetadataUpdateTaskFactory, CoreError> {
        Ok(MetadataUpdateTaskFactory::new(self.metadata_batch_size)?
            .with_timeout(self.default_task_timeout, self.max_build_timeout))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_dispatch_pool_size: 64,
            max_inflight_per_worker: 8,
            max_tasks_per_batch: 1000,
            rpc_timeout: Duration::from_secs(10),
            tablet_create_timeout: Duration::from_secs(10),
            max_build_timeout: Duration::from_secs(600),
            default_task_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
            resend_after: Duration::from_secs(600),
            max_resend_attempts: 3,
            metadata_batch_size: 200,
            leader_max_running: 4,
            leader_task_timeout: Duration::from_secs(300),
            http_bind_addr: "127.0.0.1:8030".to_string(),
        }
    }
}
