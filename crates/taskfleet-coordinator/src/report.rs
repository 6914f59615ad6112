//! Heartbeat report handling.
//!
//! A worker's report is the asynchronous completion path: finished signatures
//! are reconciled against the queue, and if the worker also sent its running
//! set, Sent tasks it has silently lost are reset and shipped again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use taskfleet_core::{TaskKey, TaskType};

use crate::config::Config;
use crate::dispatch::{DispatchExecutor, DispatchStatus};
use crate::latch::{FailureReason, Resolution};
use crate::transport::WorkerReport;

/// Counts of what one report changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    pub finished: usize,
    pub resent: usize,
    pub abandoned: usize,
}

/// Applies worker reports to the queue.
pub struct ReportHandler {
    dispatch: Arc<DispatchExecutor>,
    resend_after: Duration,
    max_resend_attempts: u32,
}

impl ReportHandler {
    /// Create a new ReportHandler.
    pub fn new(config: &Config, dispatch: Arc<DispatchExecutor>) -> Self {
        Self {
            dispatch,
            resend_after: config.resend_after,
            max_resend_attempts: config.max_resend_attempts,
        }
    }

    /// Apply one report.
    pub async fn handle(&self, report: WorkerReport) -> ReportSummary {
        let queue = self.dispatch.queue();
        let worker_id = &report.worker_id;
        let mut summary = ReportSummary::default();

        for (task_type, finished) in &report.finished {
            summary.finished += queue.reconcile(worker_id, *task_type, finished);
        }

        let Some(running) = &report.running else {
            return summary;
        };

        let empty = HashSet::new();
        let mut to_resend: Vec<TaskKey> = Vec::new();
        for task_type in TaskType::ALL {
            let running = running.get(&task_type).unwrap_or(&empty);
            for task in queue.diff(worker_id, task_type, running, self.resend_after) {
                let key = task.key();
                if task.attempt >= self.max_resend_attempts {
                    queue.complete(
                        &key,
                        Resolution::Failed(FailureReason::Unacknowledged {
                            attempts: task.attempt,
                        }),
                    );
                    summary.abandoned += 1;
                } else if queue.reset_to_pending(&key).is_some() {
                    to_resend.push(key);
                }
            }
        }

        if !to_resend.is_empty() {
            info!(
                worker_id = %worker_id,
                tasks = to_resend.len(),
                "Resending tasks missing from worker report"
            );
            let outcomes = self.dispatch.resend(worker_id, to_resend).await;
            summary.resent = outcomes
                .iter()
                .filter(|o| matches!(o.status, DispatchStatus::Sent | DispatchStatus::Finished))
                .count();
            if summary.resent < outcomes.len() {
                warn!(
                    worker_id = %worker_id,
                    failed = outcomes.len() - summary.resent,
                    "Some resends did not go through"
                );
            }
        }

        summary
    }
}
