//! HTTP API route definitions

use crate::api::{handlers, ws};
use crate::app::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Create all API routes
pub fn create_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Executions
        .route(
            "/sessions/:session_id/executions",
            post(handlers::start_execution).get(handlers::list_session_executions),
        )
        .route("/executions/:execution_id", get(handlers::get_execution))
        .route("/executions/:execution_id/pause", post(handlers::pause_execution))
        .route("/executions/:execution_id/resume", post(handlers::resume_execution))
        .route("/executions/:execution_id/execute", post(handlers::redrive_execution))
        .route(
            "/executions/:execution_id/items/:item_id/input",
            post(handlers::submit_user_input),
        )
        // Simulation and signing approvals
        .route("/simulations", post(handlers::simulate))
        .route("/approvals", get(handlers::list_approvals))
        .route("/approvals/:request_id", post(handlers::resolve_approval))
        // Real-time updates
        .route("/ws", get(ws::ws_handler))
        // Health and status endpoints
        .route("/healthz", get(handlers::health_check))
        .route("/status", get(handlers::system_status))
}
