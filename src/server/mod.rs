//! HTTP surface for the verification UI.
//!
//! JSON APIs plus the SSE progress stream; the UI itself (templates,
//! viewer assets) is an external collaborator and not part of this crate.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::orchestrator::OrchestratorRuntime;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<OrchestratorRuntime>,
}

impl AppState {
    pub fn new(runtime: Arc<OrchestratorRuntime>) -> Self {
        Self { runtime }
    }
}

/// Start the web server.
pub async fn serve(runtime: Arc<OrchestratorRuntime>, host: &str, port: u16) -> anyhow::Result<()> {
    let state = AppState::new(runtime);
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tempfile::tempdir;
    use tower::ServiceExt;

    use crate::config::Settings;

    async fn setup_test_app() -> (axum::Router, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let mut settings = Settings::with_data_dir(dir.path().to_path_buf());
        settings.fast_test_mode = true;
        let runtime = OrchestratorRuntime::new(settings).unwrap();
        let app = create_router(AppState::new(runtime));
        (app, dir)
    }

    #[tokio::test]
    async fn test_api_status_empty() {
        let (app, _dir) = setup_test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["batches"].as_array().unwrap().len(), 0);
        assert_eq!(json["active_tokens"], 0);
    }

    #[tokio::test]
    async fn test_api_batches_empty() {
        let (app, _dir) = setup_test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/batches")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_unknown_token_is_expired() {
        let (app, _dir) = setup_test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/smart/cancel/not-a-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_smart_start_returns_token_and_streams() {
        let (app, _dir) = setup_test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/smart/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let token = json["token"].as_str().unwrap().to_string();
        assert!(!token.is_empty());

        // The stream endpoint recognizes the token
        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/api/smart/stream/{}", token))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
    }

    #[tokio::test]
    async fn test_rotation_rejects_bad_angle() {
        let (app, _dir) = setup_test_app().await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/rotations")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"artifact_hash":"abc","page_index":0,"angle":45}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
