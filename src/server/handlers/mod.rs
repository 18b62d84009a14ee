//! Request handlers.

mod batches;
mod smart;

pub use batches::{
    api_status, batch_detail, export_batch, list_batches, rescan_document, serve_rotated,
    set_batch_status, set_rotation, verify_document,
};
pub use smart::{smart_cancel, smart_start, smart_stream};

use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

/// Uniform error payload: a status plus `{"error": "..."}`.
pub(crate) fn api_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<serde_json::Value>) {
    (status, Json(json!({ "error": message.into() })))
}
