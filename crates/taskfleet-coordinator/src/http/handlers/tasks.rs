//! Task queue and leader runner handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use tokio::time::Instant;

use taskfleet_core::{TaskType, WorkerId};

use crate::http::responses::{LeaderResponse, TaskResponse, WorkerResponse};
use crate::queue::TrackedTask;
use crate::state::AppState;

/// List workers that have outstanding tasks.
pub async fn list_workers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response: Vec<WorkerResponse> = state
        .queue
        .workers()
        .into_iter()
        .map(|worker_id| WorkerResponse {
            outstanding: state.queue.count_outstanding(&worker_id),
            worker_id: worker_id.as_str().to_string(),
        })
        .filter(|w| w.outstanding > 0)
        .collect();
    Json(response)
}

/// Outstanding tasks of one worker, grouped by task type in submission order.
pub async fn list_worker_tasks(
    State(state): State<Arc<AppState>>,
    Path(worker_id): Path<String>,
) -> impl IntoResponse {
    let worker_id = WorkerId::new(worker_id);
    let now = Instant::now();
    let response: Vec<TaskResponse> = TaskType::ALL
        .into_iter()
        .flat_map(|task_type| state.queue.snapshot(&worker_id, task_type))
        .map(|tracked| task_response(&tracked, now))
        .collect();
    Json(response)
}

/// Leader runner status.
pub async fn leader_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(LeaderResponse {
        is_leader: state.leader.is_leader(),
        queued: state.leader.queued_count(),
        running: state.leader.running_count(),
    })
}

fn task_response(tracked: &TrackedTask, now: Instant) -> TaskResponse {
    let task = &tracked.task;
    let deadline_in_ms = if tracked.deadline >= now {
        i64::try_from((tracked.deadline - now).as_millis()).unwrap_or(i64::MAX)
    } else {
        -i64::try_from((now - tracked.deadline).as_millis()).unwrap_or(i64::MAX)
    };
    TaskResponse {
        signature: task.signature.value(),
        task_type: task.task_type().as_str().to_string(),
        state: format!("{:?}", task.state).to_uppercase(),
        attempt: task.attempt,
        priority: task.priority.0,
        tablets: task.payload.tablet_ids().into_iter().map(|t| t.value()).collect(),
        created_at: task.created_at.to_rfc3339(),
        deadline_in_ms,
    }
}
