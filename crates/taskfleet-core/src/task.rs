//! Agent task types.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    CoreError, RecoverySource, Signature, StorageMedium, TabletId, TabletMetaUpdate,
    TabletSchema, TaskState, WorkerId,
};

/// Kind of an agent task, without its payload.
///
/// The task queue is sharded by (worker, task type).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    CreateReplica,
    UpdateTabletMeta,
    DropReplica,
    SchemaChange,
    GenericPropertyUpdate,
    MaintenanceJob,
}

impl TaskType {
    /// All task types, in a stable order.
    pub const ALL: [TaskType; 6] = [
        TaskType::CreateReplica,
        TaskType::UpdateTabletMeta,
        TaskType::DropReplica,
        TaskType::SchemaChange,
        TaskType::GenericPropertyUpdate,
        TaskType::MaintenanceJob,
    ];

    /// Snake-case name, used as a metrics label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateReplica => "create_replica",
            Self::UpdateTabletMeta => "update_tablet_meta",
            Self::DropReplica => "drop_replica",
            Self::SchemaChange => "schema_change",
            Self::GenericPropertyUpdate => "generic_property_update",
            Self::MaintenanceJob => "maintenance_job",
        }
    }
}

/// Scheduling priority. Only the leader task runner looks at it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOW: Priority = Priority(-10);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(10);
}

/// Kind-specific task payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    CreateReplica {
        tablet_id: TabletId,
        schema: TabletSchema,
        storage_medium: StorageMedium,
        recovery_source: Option<RecoverySource>,
    },
    UpdateTabletMeta {
        updates: Vec<TabletMetaUpdate>,
    },
    DropReplica {
        tablet_id: TabletId,
        force: bool,
    },
    SchemaChange {
        base_tablet_id: TabletId,
        new_tablet_id: TabletId,
        new_schema_version: i32,
    },
    GenericPropertyUpdate {
        tablet_id: TabletId,
        properties: BTreeMap<String, String>,
    },
    MaintenanceJob {
        name: String,
    },
}

impl TaskPayload {
    /// The shard tag of this payload.
    pub fn task_type(&self) -> TaskType {
        match self {
            Self::CreateReplica { .. } => TaskType::CreateReplica,
            Self::UpdateTabletMeta { .. } => TaskType::UpdateTabletMeta,
            Self::DropReplica { .. } => TaskType::DropReplica,
            Self::SchemaChange { .. } => TaskType::SchemaChange,
            Self::GenericPropertyUpdate { .. } => TaskType::GenericPropertyUpdate,
            Self::MaintenanceJob { .. } => TaskType::MaintenanceJob,
        }
    }

    /// Distinct tablets touched by this payload.
    pub fn tablet_ids(&self) -> BTreeSet<TabletId> {
        match self {
            Self::CreateReplica { tablet_id, .. }
            | Self::DropReplica { tablet_id, .. }
            | Self::GenericPropertyUpdate { tablet_id, .. } => BTreeSet::from([*tablet_id]),
            Self::UpdateTabletMeta { updates } => updates.iter().map(|u| u.tablet_id).collect(),
            Self::SchemaChange {
                base_tablet_id,
                new_tablet_id,
                ..
            } => BTreeSet::from([*base_tablet_id, *new_tablet_id]),
            Self::MaintenanceJob { .. } => BTreeSet::new(),
        }
    }
}

/// Identifies one task slot in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskKey {
    pub worker_id: WorkerId,
    pub task_type: TaskType,
    pub signature: Signature,
}

/// A unit of work bound for one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Dedup key within (worker, task type).
    pub signature: Signature,

    /// Target worker.
    pub worker_id: WorkerId,

    /// What the worker should do.
    pub payload: TaskPayload,

    /// Current task state.
    pub state: TaskState,

    /// When the task was created.
    pub created_at: DateTime<Utc>,

    /// How long the task may stay outstanding once registered.
    pub timeout: Duration,

    /// Number of times the task has been shipped.
    pub attempt: u32,

    /// Scheduling priority.
    pub priority: Priority,
}

impl Task {
    /// Create a new pending Task.
    pub fn new(
        signature: Signature,
        worker_id: WorkerId,
        payload: TaskPayload,
        timeout: Duration,
    ) -> Self {
        Self {
            signature,
            worker_id,
            payload,
            state: TaskState::Pending,
            created_at: Utc::now(),
            timeout,
            attempt: 0,
            priority: Priority::NORMAL,
        }
    }

    /// Build a CreateReplica task from a fully-specified config.
    pub fn create_replica(signature: Signature, config: CreateReplicaConfig) -> Self {
        let payload = TaskPayload::CreateReplica {
            tablet_id: config.tablet_id,
            schema: config.schema,
            storage_medium: config.storage_medium,
            recovery_source: config.recovery_source,
        };
        Self::new(signature, config.worker_id, payload, config.timeout)
    }

    /// Builder method to set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    pub fn key(&self) -> TaskKey {
        TaskKey {
            worker_id: self.worker_id.clone(),
            task_type: self.task_type(),
            signature: self.signature,
        }
    }

    /// Number of distinct tablets this task touches.
    pub fn tablet_count(&self) -> usize {
        self.payload.tablet_ids().len()
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Move to `next`, rejecting transitions that would go backwards.
    pub fn transition(&mut self, next: TaskState) -> Result<(), CoreError> {
        if !self.state.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }
}

/// Everything needed to create one replica.
#[derive(Debug, Clone)]
pub struct CreateReplicaConfig {
    pub worker_id: WorkerId,
    pub tablet_id: TabletId,
    pub schema: TabletSchema,
    pub storage_medium: StorageMedium,
    pub recovery_source: Option<RecoverySource>,
    pub timeout: Duration,
}
