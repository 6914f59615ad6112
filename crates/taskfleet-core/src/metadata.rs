//! Batching of tablet metadata changes into UpdateTabletMeta tasks.
//!
//! Shipping one task per tablet makes the RPC and queue overhead grow with the
//! tablet count. The factory folds every change destined for one worker into
//! as few tasks as the batch bound allows. Each input change lands in exactly
//! one output task, in input order.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::{CoreError, SignatureGenerator, TabletMetaUpdate, Task, TaskPayload, WorkerId};

/// Builds UpdateTabletMeta tasks out of per-tablet changes.
#[derive(Debug, Clone)]
pub struct MetadataUpdateTaskFactory {
    max_batch_size: usize,
    timeout_per_tablet: Duration,
    max_timeout: Duration,
}

impl MetadataUpdateTaskFactory {
    /// Create a factory that puts at most `max_batch_size` changes in one task.
    pub fn new(max_batch_size: usize) -> Result<Self, CoreError> {
        if max_batch_size == 0 {
            return Err(CoreError::InvalidInput(
                "metadata batch size must be positive".to_string(),
            ));
        }
        Ok(Self {
            max_batch_size,
            timeout_per_tablet: Duration::from_secs(60),
            max_timeout: Duration::from_secs(600),
        })
    }

    /// Builder method to set the timeout scaling.
    ///
    /// A task's timeout is `per_tablet` times its distinct tablet count,
    /// capped at `max`.
    pub fn with_timeout(mut self, per_tablet: Duration, max: Duration) -> Self {
        self.timeout_per_tablet = per_tablet;
        self.max_timeout = max;
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Build tasks for changes that all go to `worker_id`.
    pub fn create(
        &self,
        worker_id: &WorkerId,
        updates: Vec<TabletMetaUpdate>,
        signatures: &SignatureGenerator,
    ) -> Vec<Task> {
        let mut tasks = Vec::with_capacity(updates.len().div_ceil(self.max_batch_size));
        let mut remaining = updates.into_iter().peekable();

        while remaining.peek().is_some() {
            let batch: Vec<TabletMetaUpdate> =
                remaining.by_ref().take(self.max_batch_size).collect();
            let payload = TaskPayload::UpdateTabletMeta { updates: batch };
            let timeout = self.timeout_for(payload.tablet_ids().len());
            tasks.push(Task::new(
                signatures.next_signature(),
                worker_id.clone(),
                payload,
                timeout,
            ));
        }

        tasks
    }

    /// Build tasks for changes spread over several workers.
    pub fn create_for_workers(
        &self,
        updates: impl IntoIterator<Item = (WorkerId, TabletMetaUpdate)>,
        signatures: &SignatureGenerator,
    ) -> BTreeMap<WorkerId, Vec<Task>> {
        let mut by_worker: BTreeMap<WorkerId, Vec<TabletMetaUpdate>> = BTreeMap::new();
        for (worker_id, update) in updates {
            by_worker.entry(worker_id).or_default().push(update);
        }

        by_worker
            .into_iter()
            .map(|(worker_id, updates)| {
                let tasks = self.create(&worker_id, updates, signatures);
                (worker_id, tasks)
            })
            .collect()
    }

    fn timeout_for(&self, tablet_count: usize) -> Duration {
        let scale = u32::try_from(tablet_count.max(1)).unwrap_or(u32::MAX);
        self.timeout_per_tablet
            .saturating_mul(scale)
            .min(self.max_timeout)
    }
}
