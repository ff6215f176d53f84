//! Axum router and handlers for the admin surface (§6.3): `pause()`/
//! `resume()` over HTTP, plus health/status for operators and
//! orchestrators. No business logic lives here — every handler delegates
//! straight into the library-level listener it was handed at startup.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::state::{listener_state_label, AppState, StatusSnapshot};

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/pause", post(pause))
        .route("/resume", post(resume))
        .with_state(state)
}

async fn healthz(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"ok": true, "service": st.build.service, "version": st.build.version})))
}

async fn status(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = StatusSnapshot {
        listener_state: listener_state_label(st.listener.state().await),
        trigger_prefix: st.config.trigger_prefix.clone(),
        queue_table: st.config.queue_table.clone(),
    };
    (StatusCode::OK, Json(snapshot))
}

/// §6.3 `pause()` over HTTP. Idempotent: pausing an already-paused listener
/// is a no-op at the library level.
async fn pause(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    st.listener.pause().await;
    (StatusCode::OK, Json(json!({"listener_state": "paused"})))
}

/// §6.3 `resume()` over HTTP. Returns `502` if re-establishing the NOTIFY
/// connection fails; the caller may retry.
async fn resume(State(st): State<Arc<AppState>>) -> impl IntoResponse {
    match st.listener.resume().await {
        Ok(()) => (StatusCode::OK, Json(json!({"listener_state": "listening"}))),
        Err(error) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": error.to_string()})),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pubsub_queue::QueueService;
    use pubsub_schemas::PubSubConfig;
    use tower::ServiceExt;

    struct NoopDrainer;

    #[async_trait::async_trait]
    impl pubsub_listener::Drainer for NoopDrainer {
        async fn drain(&self) {}
    }

    fn test_state() -> Arc<AppState> {
        // sqlx::PgPool::connect_lazy never opens a socket, so this is safe
        // to build without a live database for route-shape tests.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/pubsub_daemon_route_test")
            .unwrap();
        let config = PubSubConfig {
            database_url: "postgres://localhost/pubsub_daemon_route_test".to_string(),
            ..PubSubConfig::default()
        };
        let queue = QueueService::new(pool.clone(), config.clone()).unwrap();
        let listener = Arc::new(pubsub_listener::HybridListener::new(
            pool,
            config.trigger_prefix.clone(),
            Arc::new(NoopDrainer),
        ));
        Arc::new(AppState::new(listener, queue, config))
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_reports_stopped_before_start_is_called() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["listener_state"], "stopped");
    }

    #[tokio::test]
    async fn pause_on_a_stopped_listener_is_a_harmless_no_op() {
        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().method("POST").uri("/pause").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
