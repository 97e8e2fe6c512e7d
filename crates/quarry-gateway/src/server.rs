//! HTTP boundary
//!
//! | Method   | Path             | Body                                  |
//! |----------|------------------|---------------------------------------|
//! | `POST`   | `/chat`          | `{session_id, message}` → ChatResponse |
//! | `GET`    | `/health`        | status and version                    |
//! | `GET`    | `/sessions/:id`  | session statistics, `404` if unknown  |
//! | `DELETE` | `/sessions/:id`  | close the session                     |

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use quarry_core::{ChatRequest, ChatResponse, Hub, SessionId};

use crate::{GatewayError, Result};

pub struct Server {
    hub: Arc<Hub>,
}

impl Server {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/chat", post(Self::handle_chat))
            .route("/health", get(Self::handle_health))
            .route(
                "/sessions/:id",
                get(Self::handle_session_stats).delete(Self::handle_close_session),
            )
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.hub.clone())
    }

    /// Serve until the process is stopped
    pub async fn start(&self) -> Result<()> {
        let server = &self.hub.config().server;
        let addr: SocketAddr = format!("{}:{}", server.host, server.port)
            .parse()
            .map_err(|e| GatewayError::InvalidConfig(format!("server address: {}", e)))?;

        tracing::info!(%addr, "Quarry gateway listening");
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, self.build_router())
            .await
            .map_err(|e| GatewayError::Internal(e.to_string()))?;
        Ok(())
    }

    async fn handle_chat(
        State(hub): State<Arc<Hub>>,
        Json(request): Json<ChatRequest>,
    ) -> Result<Json<ChatResponse>> {
        tracing::debug!(session_id = %request.session_id, "Chat request");
        Ok(Json(hub.handle(request).await?))
    }

    async fn handle_health(State(hub): State<Arc<Hub>>) -> impl IntoResponse {
        Json(serde_json::json!({
            "status": "healthy",
            "version": crate::VERSION,
            "max_generation_attempts": hub.config().retry.max_generation_attempts,
            "max_plan_attempts": hub.config().retry.max_plan_attempts,
        }))
    }

    async fn handle_session_stats(State(hub): State<Arc<Hub>>, Path(id): Path<String>) -> Result<Response> {
        let stats = hub.session_stats(&SessionId::from(id.as_str()))?;
        Ok(match stats {
            Some(stats) => Json(stats).into_response(),
            None => (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": format!("Session not found: {}", id) })),
            )
                .into_response(),
        })
    }

    async fn handle_close_session(
        State(hub): State<Arc<Hub>>,
        Path(id): Path<String>,
    ) -> Result<Json<serde_json::Value>> {
        let closed = hub.close_session(&SessionId::from(id.as_str())).await?;
        Ok(Json(serde_json::json!({ "closed": closed })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use quarry_core::{HeuristicCapability, QuarryConfig, SqliteStore};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn router(charts: &TempDir) -> Router {
        let hub = Hub::builder(QuarryConfig::new().with_charts_dir(charts.path()))
            .capability(Arc::new(HeuristicCapability::new()))
            .with_sqlite(Arc::new(SqliteStore::open_in_memory().unwrap()))
            .build()
            .unwrap();
        Server::new(Arc::new(hub)).build_router()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn chat(session: &str, message: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from(
                serde_json::json!({ "session_id": session, "message": message }).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let charts = TempDir::new().unwrap();
        let response = router(&charts)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["max_plan_attempts"], 2);
    }

    #[tokio::test]
    async fn test_refusal_is_ok_with_success_false() {
        let charts = TempDir::new().unwrap();
        let response = router(&charts).oneshot(chat("web", "tell me a joke")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = json_body(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["category"], "rejected");
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let charts = TempDir::new().unwrap();
        let app = router(&charts);

        let missing = app
            .clone()
            .oneshot(Request::builder().uri("/sessions/web").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        app.clone().oneshot(chat("web", "tell me a joke")).await.unwrap();

        let stats = app
            .clone()
            .oneshot(Request::builder().uri("/sessions/web").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(stats.status(), StatusCode::OK);
        let body = json_body(stats).await;
        assert_eq!(body["message_count"], 1);
        assert_eq!(body["refusals"], 1);

        let closed = app
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri("/sessions/web")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(closed).await["closed"], true);
    }

    #[tokio::test]
    async fn test_malformed_body_is_client_error() {
        let charts = TempDir::new().unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from("{\"message\": 3}"))
            .unwrap();
        let response = router(&charts).oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
