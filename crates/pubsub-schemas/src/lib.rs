//! Shared wire/in-memory types for the pg-pubsub engine.
//!
//! Every other crate in the workspace depends on this one, so it must
//! never depend back on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// One of the three change kinds a trigger can fire for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_sql(self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

/// The JSON payload stored in `payload` and emitted by the generated
/// trigger function (§3.5, §6.1). `id` here is the trigger's own random
/// UUID, not the queue row id — callers must replace it with the queue
/// row id once decoded (see spec §9 design notes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum QueuePayload {
    #[serde(rename = "INSERT")]
    Insert {
        id: Value,
        schema: String,
        table: String,
        data: Value,
    },
    #[serde(rename = "DELETE")]
    Delete {
        id: Value,
        schema: String,
        table: String,
        data: Value,
    },
    #[serde(rename = "UPDATE")]
    Update {
        id: Value,
        schema: String,
        table: String,
        data: UpdateDiff,
    },
}

/// `data` shape for an UPDATE payload, before `updatedFields` is computed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDiff {
    pub new: Value,
    pub old: Value,
}

/// Per-message bookkeeping attached by the message processor (§4.6 step 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
}

/// Fully decoded, property-remapped change event handed to handlers.
/// `id` is always the queue row id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ChangeEvent {
    #[serde(rename = "INSERT")]
    Insert {
        id: i64,
        schema: String,
        table: String,
        data: Value,
        #[serde(rename = "_metadata")]
        metadata: ChangeMetadata,
    },
    #[serde(rename = "DELETE")]
    Delete {
        id: i64,
        schema: String,
        table: String,
        data: Value,
        #[serde(rename = "_metadata")]
        metadata: ChangeMetadata,
    },
    #[serde(rename = "UPDATE")]
    Update {
        id: i64,
        schema: String,
        table: String,
        data: UpdatedData,
        #[serde(rename = "_metadata")]
        metadata: ChangeMetadata,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatedData {
    pub new: Value,
    pub old: Value,
    #[serde(rename = "updatedFields")]
    pub updated_fields: Vec<String>,
}

impl ChangeEvent {
    pub fn id(&self) -> i64 {
        match self {
            ChangeEvent::Insert { id, .. }
            | ChangeEvent::Delete { id, .. }
            | ChangeEvent::Update { id, .. } => *id,
        }
    }

    pub fn table(&self) -> &str {
        match self {
            ChangeEvent::Insert { table, .. }
            | ChangeEvent::Delete { table, .. }
            | ChangeEvent::Update { table, .. } => table,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::Insert { .. } => ChangeKind::Insert,
            ChangeEvent::Update { .. } => ChangeKind::Update,
            ChangeEvent::Delete { .. } => ChangeKind::Delete,
        }
    }
}

/// Lifecycle state of a queue row (§3.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl QueueStatus {
    pub fn as_sql(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Processed => "processed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn from_sql(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "processed" => Some(QueueStatus::Processed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

/// One persisted queue row (§3.3), as read back from the database.
#[derive(Debug, Clone)]
pub struct QueueRow {
    pub id: i64,
    pub channel: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub status: QueueStatus,
}

/// Reconciliation strategy for C5 — both satisfy the invariants in spec
/// §4.4; the choice trades an atomicity guarantee for a no-gap guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileStrategy {
    AtomicReplace,
    DifferentialUpsert,
}

/// Recognized configuration (§6.2).
#[derive(Clone)]
pub struct PubSubConfig {
    pub database_url: String,
    pub tls: TlsMode,
    pub trigger_schema: String,
    pub trigger_prefix: String,
    pub queue_table: String,
    pub max_retries: i32,
    pub message_ttl: chrono::Duration,
    pub cleanup_interval: std::time::Duration,
    pub reconcile_strategy: ReconcileStrategy,
    /// Open Question (spec §9): default false, matching the documented
    /// default behavior (unhandled handler exceptions ⇒ logged, ids
    /// treated as processed for that handler).
    pub treat_unhandled_handler_errors_as_failures: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    Off,
    Require,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            tls: TlsMode::Off,
            trigger_schema: "public".to_string(),
            trigger_prefix: "pubsub_trigger".to_string(),
            queue_table: "pg_pubsub_queue".to_string(),
            max_retries: 5,
            message_ttl: chrono::Duration::hours(24),
            cleanup_interval: std::time::Duration::from_secs(3600),
            reconcile_strategy: ReconcileStrategy::DifferentialUpsert,
            treat_unhandled_handler_errors_as_failures: false,
        }
    }
}

/// `database_url` carries credentials; never print it verbatim.
impl std::fmt::Debug for PubSubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubConfig")
            .field("database_url", &"<REDACTED>")
            .field("tls", &self.tls)
            .field("trigger_schema", &self.trigger_schema)
            .field("trigger_prefix", &self.trigger_prefix)
            .field("queue_table", &self.queue_table)
            .field("max_retries", &self.max_retries)
            .field("message_ttl", &self.message_ttl)
            .field("cleanup_interval", &self.cleanup_interval)
            .field("reconcile_strategy", &self.reconcile_strategy)
            .field(
                "treat_unhandled_handler_errors_as_failures",
                &self.treat_unhandled_handler_errors_as_failures,
            )
            .finish()
    }
}

/// Error taxonomy (§7): configuration errors are fatal at startup,
/// transient DB errors are logged/retried by the caller, decode errors
/// are scoped to a single message.
#[derive(Debug, thiserror::Error)]
pub enum PubSubError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("no ORM metadata registered for target {0:?}")]
    MissingMetadata(String),

    #[error("failed to decode queue payload for message {id}: {source}")]
    Decode {
        id: i64,
        #[source]
        source: serde_json::Error,
    },
}

/// Handler registration merge rules (§3.1). Multiple registrations for the
/// same table fold event masks and payload fields with set union, and
/// append handler instances to the fan-out list in discovery order.
pub fn merge_event_masks(
    a: Option<HashSet<ChangeKind>>,
    b: Option<HashSet<ChangeKind>>,
) -> Option<HashSet<ChangeKind>> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x),
        (Some(mut x), Some(y)) => {
            x.extend(y);
            Some(x)
        }
    }
}

pub fn merge_payload_fields(a: Option<Vec<String>>, b: Option<Vec<String>>) -> Option<Vec<String>> {
    match (a, b) {
        (None, None) => None,
        (Some(x), None) | (None, Some(x)) => Some(x),
        (Some(x), Some(y)) => {
            let mut set: Vec<String> = x;
            for field in y {
                if !set.contains(&field) {
                    set.push(field);
                }
            }
            Some(set)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_event_masks_unions_sets() {
        let a = Some(HashSet::from([ChangeKind::Insert]));
        let b = Some(HashSet::from([ChangeKind::Update]));
        let merged = merge_event_masks(a, b).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.contains(&ChangeKind::Insert));
        assert!(merged.contains(&ChangeKind::Update));
    }

    #[test]
    fn merge_event_masks_none_is_full_set() {
        assert_eq!(merge_event_masks(None, None), None);
    }

    #[test]
    fn merge_payload_fields_dedupes_preserving_first_order() {
        let a = Some(vec!["name".to_string(), "email".to_string()]);
        let b = Some(vec!["email".to_string(), "age".to_string()]);
        let merged = merge_payload_fields(a, b).unwrap();
        assert_eq!(merged, vec!["name", "email", "age"]);
    }

    #[test]
    fn queue_status_round_trips_through_sql_text() {
        for s in [
            QueueStatus::Pending,
            QueueStatus::Processing,
            QueueStatus::Processed,
            QueueStatus::Failed,
        ] {
            assert_eq!(QueueStatus::from_sql(s.as_sql()), Some(s));
        }
    }
}
