//! HTTP surface — axum router over the dispatcher.
//!
//! - `routes` — handlers for submission, polling, listing and cancellation
//! - `auth` — API-key check and per-key rate limiting on POST routes

pub mod auth;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;

pub use auth::RateLimiter;
pub use routes::ApiError;

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub config: Arc<ServerConfig>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(dispatcher: Arc<Dispatcher>, config: ServerConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.rate_requests, config.rate_window));
        Self {
            dispatcher,
            config: Arc::new(config),
            limiter,
        }
    }
}

/// Build the application router with auth, body limit and CORS layers.
pub fn router(state: AppState) -> Router {
    let max_body = state.config.max_request_bytes;

    Router::new()
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/tasks", get(routes::list_tasks).post(routes::submit_task))
        .route("/tasks/{id}/cancel", post(routes::cancel_task))
        .route("/results/{id}", get(routes::get_result))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::guard))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::JobEventBus;
    use crate::store::{JobStore, LibSqlBackend, NotifyingStore};
    use crate::tasks::TaskRegistry;
    use crate::waiter::ResultWaiter;
    use crate::worker::CancelRegistry;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn app(config: ServerConfig) -> Router {
        let events = JobEventBus::new();
        let backend = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let store: Arc<dyn JobStore> = Arc::new(NotifyingStore::new(backend, Arc::clone(&events)));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(TaskRegistry::with_builtins()),
            Arc::new(CancelRegistry::new()),
            ResultWaiter::new(store, events),
            Arc::new(crate::config::OrchestratorConfig::default()),
        );
        router(AppState::new(Arc::new(dispatcher), config))
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn submit(body: &str) -> Request<Body> {
        Request::post("/tasks")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn submit_returns_job_id() {
        let app = app(ServerConfig::default()).await;
        let response = app
            .oneshot(submit(r#"{"task": "Plan", "payload": {"goal": "x"}}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["ok"], true);
        assert_eq!(body["received"]["task"], "plan");
        assert!(body["job_id"].as_str().is_some());
    }

    #[tokio::test]
    async fn malformed_json_is_400_with_detail() {
        let app = app(ServerConfig::default()).await;
        let response = app.oneshot(submit("{not json")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(body["detail"].is_string());
    }

    #[tokio::test]
    async fn reads_skip_the_key_check() {
        let app = app(ServerConfig::default().with_api_keys("secret")).await;

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(submit(r#"{"task": "plan"}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
