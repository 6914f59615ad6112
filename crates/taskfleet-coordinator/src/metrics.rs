//! Prometheus metrics collection and formatting.
//!
//! This module provides metrics in Prometheus text exposition format.

use std::fmt::Write;
use std::sync::Arc;

use taskfleet_core::{TaskState, TaskType};

use crate::state::AppState;

/// Collect all metrics from AppState and format as Prometheus text.
pub fn collect_metrics(state: &Arc<AppState>) -> String {
    let mut output = String::new();

    collect_task_metrics(state, &mut output);
    collect_dispatch_metrics(state, &mut output);
    collect_leader_metrics(state, &mut output);

    output
}

/// Outstanding tasks by type and state. Every (type, state) pair is written,
/// zero or not, so series do not disappear.
fn collect_task_metrics(state: &Arc<AppState>, output: &mut String) {
    let counts = state.queue.count_by_state();

    writeln!(
        output,
        "# HELP taskfleet_tasks_outstanding Outstanding worker tasks by type and state"
    )
    .ok();
    writeln!(output, "# TYPE taskfleet_tasks_outstanding gauge").ok();
    for task_type in TaskType::ALL {
        for task_state in [TaskState::Pending, TaskState::Sent] {
            let count = counts.get(&(task_type, task_state)).copied().unwrap_or(0);
            writeln!(
                output,
                "taskfleet_tasks_outstanding{{task_type=\"{}\",state=\"{}\"}} {count}",
                task_type.as_str(),
                format!("{task_state:?}").to_lowercase()
            )
            .ok();
        }
    }
}

fn collect_dispatch_metrics(state: &Arc<AppState>, output: &mut String) {
    let free = state.dispatch.available_slots();
    let size = state.dispatch.pool_size();

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskfleet_dispatch_pool_in_use Dispatch RPC slots in use"
    )
    .ok();
    writeln!(output, "# TYPE taskfleet_dispatch_pool_in_use gauge").ok();
    writeln!(
        output,
        "taskfleet_dispatch_pool_in_use {}",
        size.saturating_sub(free)
    )
    .ok();
    writeln!(output, "# HELP taskfleet_dispatch_pool_size Dispatch RPC pool size").ok();
    writeln!(output, "# TYPE taskfleet_dispatch_pool_size gauge").ok();
    writeln!(output, "taskfleet_dispatch_pool_size {size}").ok();
}

fn collect_leader_metrics(state: &Arc<AppState>, output: &mut String) {
    let leader = &state.leader;

    writeln!(output).ok();
    writeln!(
        output,
        "# HELP taskfleet_leader Whether this node currently holds leadership"
    )
    .ok();
    writeln!(output, "# TYPE taskfleet_leader gauge").ok();
    writeln!(output, "taskfleet_leader {}", u8::from(leader.is_leader())).ok();

    writeln!(
        output,
        "# HELP taskfleet_leader_tasks Leader tasks by status"
    )
    .ok();
    writeln!(output, "# TYPE taskfleet_leader_tasks gauge").ok();
    writeln!(
        output,
        "taskfleet_leader_tasks{{status=\"queued\"}} {}",
        leader.queued_count()
    )
    .ok();
    writeln!(
        output,
        "taskfleet_leader_tasks{{status=\"running\"}} {}",
        leader.running_count()
    )
    .ok();
}
