//! `pubsub-daemon` entry point.
//!
//! Thin by design: load config, run discovery, take the reconcile lock and
//! reconcile triggers, start the listener + processor, serve the admin
//! surface, and shut down cleanly on SIGTERM/Ctrl-C. All route handlers
//! live in `routes.rs`; all shared state lives in `state.rs`.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use pubsub_discovery::{discover, OrmMetadataProvider, TableDescriptor};
use pubsub_lock::AdvisoryLockService;
use pubsub_processor::MessageProcessor;
use pubsub_queue::QueueService;
use pubsub_trigger::TriggerService;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use pubsub_daemon::{routes, state};

/// Stands in for the host application's ORM integration. The standalone
/// daemon binary registers no handlers of its own — embedding applications
/// call the `pubsub-*` library crates directly and wire their own
/// `OrmMetadataProvider`; see `pubsub-discovery::OrmMetadataProvider`.
struct EmptyOrm;

impl OrmMetadataProvider for EmptyOrm {
    fn table_descriptor(&self, _entity_target: &str) -> Option<TableDescriptor> {
        None
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pubsub_config::bootstrap_dotenv();
    init_tracing();

    let loaded = pubsub_config::load(std::env::var("PUBSUB_CONFIG_FILE").ok().as_deref())
        .context("failed to load configuration")?;
    info!(config_hash = %loaded.config_hash, "configuration loaded");
    let config = loaded.config;

    let connect_options = pubsub_config::pg_connect_options(&config)
        .context("failed to build database connection options")?;
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect_with(connect_options)
        .await
        .context("failed to connect to database")?;

    let queue = QueueService::new(pool.clone(), config.clone())?;
    queue.setup().await.context("failed to set up queue table")?;
    queue.spawn_cleanup_timer();

    // No handlers are registered by the standalone binary (see EmptyOrm);
    // reconciliation against an empty discovery result drops any
    // previously-installed `<prefix>_*` triggers and installs none.
    let discovery = Arc::new(
        discover(Vec::new(), &EmptyOrm, &config.trigger_schema).context("discovery failed")?,
    );

    let lock = AdvisoryLockService::new(pool.clone());
    let trigger_service = TriggerService::new(pool.clone(), lock, config.clone());
    trigger_service
        .reconcile(&discovery)
        .await
        .context("trigger reconciliation failed")?;

    let processor = Arc::new(MessageProcessor::new(queue.clone(), discovery, config.clone()));
    let listener = Arc::new(pubsub_listener::HybridListener::new(
        pool,
        config.trigger_prefix.clone(),
        processor as Arc<dyn pubsub_listener::Drainer>,
    ));
    listener.start().await.context("failed to start listener")?;

    let shared = Arc::new(state::AppState::new(listener.clone(), queue, config));
    let app = routes::build_router(shared).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    let addr = bind_addr_from_env().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8900)));
    info!("pubsub-daemon admin surface listening on http://{addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server crashed")?;

    listener.pause().await;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn bind_addr_from_env() -> Option<SocketAddr> {
    std::env::var("PUBSUB_DAEMON_ADDR").ok()?.parse().ok()
}

/// Waits for Ctrl-C or SIGTERM so the listener's teardown path (§4.5
/// cancellation) runs before the process exits.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining listener");
}
