//! Router configuration for the web server.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Pipeline triggers
        .route("/api/scrape", post(handlers::start_pipeline))
        .route("/api/process", post(handlers::start_process))
        .route("/api/indexcsv", post(handlers::start_indices))
        // Pipeline control and queries
        .route("/api/pipeline/status", get(handlers::pipeline_status))
        .route("/api/pipeline/stop", post(handlers::stop_pipeline))
        // Server status
        .route("/api/status", get(handlers::server_status))
        // Event stream
        .route("/ws", get(handlers::ws_upgrade))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
