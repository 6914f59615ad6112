//! HTTP request handlers.

mod health;
mod tasks;

pub use health::{health_check, metrics_handler};
pub use tasks::{leader_status, list_worker_tasks, list_workers};
