//! End-to-end admin-route tests against a live database. All are gated
//! behind `PUBSUB_DATABASE_URL` and `#[ignore]`, the same pattern every
//! other `#[ignore]`-gated integration test in this workspace follows.

use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use pubsub_daemon::{routes, state::AppState};
use pubsub_listener::{Drainer, HybridListener};
use pubsub_queue::QueueService;
use pubsub_schemas::PubSubConfig;
use sqlx::postgres::PgPoolOptions;
use tower::ServiceExt;

const ENV_DB_URL: &str = "PUBSUB_DATABASE_URL";

struct NoopDrainer;

#[async_trait]
impl Drainer for NoopDrainer {
    async fn drain(&self) {}
}

async fn build_state(suffix: &str) -> Option<Arc<AppState>> {
    let url = std::env::var(ENV_DB_URL).ok()?;
    let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.ok()?;
    let mut config = PubSubConfig::default();
    config.database_url = url;
    config.queue_table = format!("pubsub_daemon_admin_test_{suffix}");
    let queue = QueueService::new(pool.clone(), config.clone()).ok()?;
    queue.setup().await.ok()?;
    let listener = Arc::new(HybridListener::new(pool, config.trigger_prefix.clone(), Arc::new(NoopDrainer)));
    Some(Arc::new(AppState::new(listener, queue, config)))
}

#[tokio::test]
#[ignore = "requires PUBSUB_DATABASE_URL; run with --include-ignored"]
async fn pause_then_resume_round_trips_through_http() {
    let Some(state) = build_state("pause_resume").await else {
        return;
    };
    state.listener.start().await.unwrap();
    let app = routes::build_router(state.clone());

    let paused = app
        .clone()
        .oneshot(Request::builder().method("POST").uri("/pause").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(paused.status(), StatusCode::OK);
    assert_eq!(state.listener.state().await, pubsub_listener::ListenerState::Paused);

    let resumed = app
        .oneshot(Request::builder().method("POST").uri("/resume").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resumed.status(), StatusCode::OK);
    assert_eq!(state.listener.state().await, pubsub_listener::ListenerState::Listening);
}

#[tokio::test]
#[ignore = "requires PUBSUB_DATABASE_URL; run with --include-ignored"]
async fn status_reflects_configured_queue_table() {
    let Some(state) = build_state("status").await else {
        return;
    };
    let queue_table = state.config.queue_table.clone();
    let app = routes::build_router(state);

    let response = app
        .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["queue_table"], queue_table);
}
