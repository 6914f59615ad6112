//! HTTP diagnostics server for the coordinator.
//!
//! Provides endpoints for:
//! - Worker list API (`/v1/workers`)
//! - Outstanding tasks of one worker (`/v1/workers/:worker_id/tasks`)
//! - Leader runner status (`/v1/leader`)
//! - Health check (`/health`)
//! - Prometheus metrics (`/metrics`)

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod handlers;
pub mod responses;

/// Create the HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // API routes
        .route("/v1/workers", get(handlers::list_workers))
        .route("/v1/workers/:worker_id/tasks", get(handlers::list_worker_tasks))
        .route("/v1/leader", get(handlers::leader_status))
        // Observability routes
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
