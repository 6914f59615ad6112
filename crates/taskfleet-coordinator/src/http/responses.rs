//! HTTP request and response types.

use serde::{Deserialize, Serialize};

// ============================================================================
// Worker types
// ============================================================================

/// One worker with outstanding tasks.
#[derive(Debug, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub worker_id: String,
    pub outstanding: usize,
}

/// One outstanding task.
#[derive(Debug, Serialize, Deserialize)]
pub struct TaskResponse {
    pub signature: u64,
    pub task_type: String,
    pub state: String,
    pub attempt: u32,
    pub priority: i32,
    pub tablets: Vec<u64>,
    pub created_at: String,
    /// Milliseconds until the task's deadline; negative once overdue.
    pub deadline_in_ms: i64,
}

// ============================================================================
// Leader types
// ============================================================================

/// Leader runner status.
#[derive(Debug, Serialize, Deserialize)]
pub struct LeaderResponse {
    pub is_leader: bool,
    pub queued: usize,
    pub running: usize,
}
