//! Shared runtime state for `pubsub-daemon`.
//!
//! Mirrors the `AppState` shape used elsewhere in this workspace: a single
//! `Clone`-able (via `Arc`) handle passed to every Axum route, owning the
//! listener, the queue service, and static build metadata.

use std::sync::Arc;

use pubsub_listener::{HybridListener, ListenerState};
use pubsub_queue::QueueService;
use pubsub_schemas::PubSubConfig;
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub listener: Arc<HybridListener>,
    pub queue: QueueService,
    pub config: PubSubConfig,
    pub build: BuildInfo,
}

impl AppState {
    pub fn new(listener: Arc<HybridListener>, queue: QueueService, config: PubSubConfig) -> Self {
        Self {
            listener,
            queue,
            config,
            build: BuildInfo {
                service: "pubsub-daemon",
                version: env!("CARGO_PKG_VERSION"),
            },
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub listener_state: &'static str,
    pub trigger_prefix: String,
    pub queue_table: String,
}

pub fn listener_state_label(state: ListenerState) -> &'static str {
    match state {
        ListenerState::Stopped => "stopped",
        ListenerState::Connecting => "connecting",
        ListenerState::Listening => "listening",
        ListenerState::Paused => "paused",
    }
}
