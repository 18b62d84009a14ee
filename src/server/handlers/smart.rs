//! Smart processing endpoints: start, SSE progress stream, cancel.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::orchestrator::{events::ProgressEvent, TokenRegistry};
use crate::server::AppState;

use super::api_error;

/// Cancels the run if the SSE connection goes away before the terminal
/// event. Completed runs are left alone.
struct CancelOnDrop {
    registry: Arc<TokenRegistry>,
    token: String,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.registry.cancel_if_running(&self.token);
    }
}

/// POST /api/smart/start
pub async fn smart_start(State(state): State<AppState>) -> Json<serde_json::Value> {
    let token = state.runtime.start_smart_processing();
    Json(json!({ "token": token }))
}

/// GET /api/smart/stream/{token}
pub async fn smart_stream(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, Json<serde_json::Value>)>
{
    let registry = state.runtime.tokens().clone();
    let Some(subscription) = registry.subscribe(&token) else {
        return Err(api_error(StatusCode::NOT_FOUND, "unknown or expired token"));
    };

    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        let _guard = CancelOnDrop {
            registry,
            token,
        };

        for event in &subscription.history {
            let terminal = event.is_terminal();
            if send_event(&tx, event).await.is_err() {
                return;
            }
            if terminal {
                return;
            }
        }
        if subscription.completed {
            return;
        }

        let mut receiver = subscription.receiver;
        while let Ok(event) = receiver.recv().await {
            let terminal = event.is_terminal();
            if send_event(&tx, &event).await.is_err() {
                return;
            }
            if terminal {
                return;
            }
        }
    });

    Ok(Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default()))
}

async fn send_event(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    event: &ProgressEvent,
) -> Result<(), ()> {
    let data = serde_json::to_string(event).unwrap_or_default();
    tx.send(Ok(Event::default().data(data))).await.map_err(|_| ())
}

/// POST /api/smart/cancel/{token}
pub async fn smart_cancel(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if state.runtime.cancel(&token) {
        Ok(Json(json!({ "cancelled": true })))
    } else {
        Err(api_error(StatusCode::NOT_FOUND, "unknown or expired token"))
    }
}
