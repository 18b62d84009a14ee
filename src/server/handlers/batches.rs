//! Batch, document, rotation, and status endpoints.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::export::ExportError;
use crate::models::{Batch, BatchStatus, RescanMode};
use crate::pipeline::{CancelFlag, PipelineError};
use crate::repository::{interaction::events as log_events, RepositoryError};
use crate::server::AppState;

use super::api_error;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn batch_json(batch: &Batch) -> serde_json::Value {
    json!({
        "id": batch.id,
        "kind": batch.kind.as_str(),
        "status": batch.status.as_str(),
        "created_at": batch.created_at.to_rfc3339(),
        "updated_at": batch.updated_at.to_rfc3339(),
    })
}

/// GET /api/batches
pub async fn list_batches(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batches = state
        .runtime
        .batches()
        .list()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let mut out = Vec::with_capacity(batches.len());
    for batch in &batches {
        let counts = state
            .runtime
            .documents()
            .count_by_state(batch.id)
            .unwrap_or_default();
        let mut entry = batch_json(batch);
        entry["document_counts"] = counts
            .into_iter()
            .map(|(state, count)| (state, json!(count)))
            .collect::<serde_json::Map<_, _>>()
            .into();
        out.push(entry);
    }
    Ok(Json(json!(out)))
}

/// GET /api/batches/{id}
pub async fn batch_detail(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batch = state
        .runtime
        .batches()
        .get(batch_id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "batch not found"))?;

    let documents = state
        .runtime
        .documents()
        .list_by_batch(batch_id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let grouped = state
        .runtime
        .documents()
        .list_grouped_by_batch(batch_id)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "batch": batch_json(&batch),
        "documents": documents,
        "grouped_documents": grouped,
    })))
}

#[derive(Deserialize)]
pub struct StatusBody {
    pub status: String,
}

/// POST /api/batches/{id}/status — explicit transition; the admin reset to
/// `pending_processing` is the only sanctioned backward move.
pub async fn set_batch_status(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
    Json(body): Json<StatusBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = BatchStatus::from_str(&body.status)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "unknown status"))?;

    match state.runtime.batches().transition(batch_id, status) {
        Ok(batch) => {
            state.runtime.interaction_log().append(
                log_events::BATCH_STATUS,
                Some(batch_id),
                None,
                status.as_str(),
            );
            Ok(Json(batch_json(&batch)))
        }
        Err(RepositoryError::NotFound(_)) => {
            Err(api_error(StatusCode::NOT_FOUND, "batch not found"))
        }
        Err(RepositoryError::InvalidTransition(msg)) => {
            Err(api_error(StatusCode::CONFLICT, msg))
        }
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

/// POST /api/batches/{id}/export
pub async fn export_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.runtime.exporter().export_batch(batch_id).await {
        Ok(report) => Ok(Json(json!({
            "batch_id": report.batch_id,
            "written": report.written,
            "skipped": report.skipped,
            "tags_extracted": report.tags_extracted,
            "warnings": report.warnings,
        }))),
        Err(ExportError::NotFound(msg)) => Err(api_error(StatusCode::NOT_FOUND, msg)),
        Err(ExportError::Incomplete(msg)) => Err(api_error(StatusCode::CONFLICT, msg)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct RescanBody {
    pub mode: String,
}

/// POST /api/documents/{id}/rescan
pub async fn rescan_document(
    State(state): State<AppState>,
    Path(doc_id): Path<i64>,
    Json(body): Json<RescanBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let mode = RescanMode::from_str(&body.mode)
        .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "unknown rescan mode"))?;

    state.runtime.interaction_log().append(
        log_events::RESCAN_REQUESTED,
        None,
        Some(doc_id),
        &body.mode,
    );

    let cancel = CancelFlag::new();
    match state.runtime.pipeline().rescan(doc_id, mode, &cancel).await {
        Ok(outcome) => Ok(Json(json!({
            "cached": outcome.cached,
            "rotation": outcome.rotation,
            "category": outcome.ai.as_ref().map(|a| a.category.clone()),
            "filename": outcome.ai.as_ref().and_then(|a| a.filename.clone()),
        }))),
        Err(PipelineError::NotFound(msg)) => Err(api_error(StatusCode::NOT_FOUND, msg)),
        Err(PipelineError::Throttled) => Err(api_error(
            StatusCode::TOO_MANY_REQUESTS,
            "rescan throttled; retry in a few seconds",
        )),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

#[derive(Deserialize)]
pub struct VerifyBody {
    pub category: String,
    pub filename: String,
}

/// POST /api/documents/{id}/verify — the user's final category/filename.
pub async fn verify_document(
    State(state): State<AppState>,
    Path(doc_id): Path<i64>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.category.trim().is_empty() || body.filename.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "category and filename are required",
        ));
    }
    state
        .runtime
        .documents()
        .set_final(doc_id, body.category.trim(), body.filename.trim())
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.runtime.interaction_log().append(
        log_events::CATEGORY_CHANGED,
        None,
        Some(doc_id),
        body.category.trim(),
    );
    Ok(Json(json!({ "verified": true })))
}

#[derive(Deserialize)]
pub struct RotationBody {
    pub artifact_hash: String,
    pub page_index: u32,
    pub angle: u16,
}

/// POST /api/rotations — persist a per-page rotation override.
pub async fn set_rotation(
    State(state): State<AppState>,
    Json(body): Json<RotationBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if ![0, 90, 180, 270].contains(&body.angle) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "angle must be one of 0, 90, 180, 270",
        ));
    }
    state
        .runtime
        .documents()
        .set_rotation(&body.artifact_hash, body.page_index, body.angle)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    state.runtime.interaction_log().append(
        log_events::ROTATION_SET,
        None,
        None,
        &format!(
            "{} page {} -> {}°",
            body.artifact_hash, body.page_index, body.angle
        ),
    );
    Ok(Json(json!({ "saved": true })))
}

/// GET /files/rotated/{hash}/{angle} — serve the normalized PDF rotated to
/// the requested angle, from the angle-tagged cache.
pub async fn serve_rotated(
    State(state): State<AppState>,
    Path((hash, angle)): Path<(String, u16)>,
) -> Result<impl IntoResponse, ApiError> {
    if ![0, 90, 180, 270].contains(&angle) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "angle must be one of 0, 90, 180, 270",
        ));
    }

    let normalizer = state.runtime.normalizer();
    let normalized = normalizer.cached_path(&hash);
    if !normalized.exists() {
        return Err(api_error(StatusCode::NOT_FOUND, "artifact not in cache"));
    }

    let cache_dir = normalizer.cache_dir().to_path_buf();
    let (path, reused) = tokio::task::spawn_blocking(move || {
        crate::pdf::ensure_rotated(&normalized, &cache_dir, &hash, angle)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    tracing::debug!("serving rotated pdf {} (cache hit: {})", path.display(), reused);

    let content_type = mime_guess::from_path(&path)
        .first_or_octet_stream()
        .to_string();
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes))
}

/// GET /api/status — batches, token count, and cache size.
pub async fn api_status(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let batches = state
        .runtime
        .batches()
        .list()
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    let cache_entries = std::fs::read_dir(state.runtime.normalizer().cache_dir())
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    e.path()
                        .extension()
                        .map(|ext| ext == "pdf")
                        .unwrap_or(false)
                })
                .count()
        })
        .unwrap_or(0);

    Ok(Json(json!({
        "batches": batches.iter().map(batch_json).collect::<Vec<_>>(),
        "active_tokens": state.runtime.tokens().len(),
        "normalized_cache_entries": cache_entries,
    })))
}
