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
        // Smart processing lifecycle
        .route("/api/smart/start", post(handlers::smart_start))
        .route("/api/smart/stream/:token", get(handlers::smart_stream))
        .route("/api/smart/cancel/:token", post(handlers::smart_cancel))
        // Batches and documents
        .route("/api/batches", get(handlers::list_batches))
        .route("/api/batches/:batch_id", get(handlers::batch_detail))
        .route("/api/batches/:batch_id/status", post(handlers::set_batch_status))
        .route("/api/batches/:batch_id/export", post(handlers::export_batch))
        .route("/api/documents/:doc_id/rescan", post(handlers::rescan_document))
        .route("/api/documents/:doc_id/verify", post(handlers::verify_document))
        // Rotation overrides and rotated serving
        .route("/api/rotations", post(handlers::set_rotation))
        .route("/files/rotated/:hash/:angle", get(handlers::serve_rotated))
        // Status
        .route("/api/status", get(handlers::api_status))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
