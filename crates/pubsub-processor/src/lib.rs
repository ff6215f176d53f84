//! C7 — the message processor: claim a batch, decode and remap it, group
//! by table, fan out to handlers, and resolve processed/failed ids (§4.6).

use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use pubsub_discovery::{ChangeBatch, ChangeHandler, DiscoveryResult};
use pubsub_hash::updated_fields;
use pubsub_queue::QueueService;
use pubsub_schemas::{ChangeEvent, ChangeMetadata, PubSubConfig, PubSubError, QueuePayload, QueueRow, UpdatedData};
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

pub struct MessageProcessor {
    queue: QueueService,
    discovery: Arc<DiscoveryResult>,
    config: PubSubConfig,
}

impl MessageProcessor {
    pub fn new(queue: QueueService, discovery: Arc<DiscoveryResult>, config: PubSubConfig) -> Self {
        Self {
            queue,
            discovery,
            config,
        }
    }

    /// Run one full drain (§4.6 steps 1-8). Returns the number of rows
    /// claimed, so callers (the fallback/notify loops) can skip logging
    /// empty drains.
    pub async fn drain(&self) -> Result<usize, PubSubError> {
        let rows = self
            .queue
            .claim_batch(&self.config.trigger_prefix, pubsub_queue::DEFAULT_BATCH_SIZE)
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let claimed = rows.len();

        let mut events = Vec::with_capacity(rows.len());
        let mut failed_ids: HashSet<i64> = HashSet::new();
        for row in rows {
            match decode_row(&row, &self.discovery) {
                Ok(event) => events.push(event),
                Err(error) => {
                    warn!(id = row.id, %error, "failed to decode queue row, marking failed");
                    failed_ids.insert(row.id);
                }
            }
        }

        // Already ascending by claim order; filtering above preserves order.
        events.sort_by_key(|e| e.id());

        let mut grouped: HashMap<String, Vec<ChangeEvent>> = HashMap::new();
        for event in events {
            grouped.entry(event.table().to_string()).or_default().push(event);
        }

        let mut processed_ids: Vec<i64> = Vec::new();
        for (table, table_events) in grouped {
            let ids: Vec<i64> = table_events.iter().map(|e| e.id()).collect();
            let handlers = self
                .discovery
                .listener_for_table_name(&table)
                .map(|listener| listener.handlers.clone())
                .unwrap_or_default();

            let table_failed = dispatch_table(
                &table,
                &handlers,
                &table_events,
                self.config.treat_unhandled_handler_errors_as_failures,
            )
            .await;

            for id in ids {
                if table_failed.contains(&id) {
                    failed_ids.insert(id);
                } else {
                    processed_ids.push(id);
                }
            }
        }

        let failed: Vec<i64> = failed_ids.into_iter().collect();
        debug!(claimed, processed = processed_ids.len(), failed = failed.len(), "drain complete");
        self.queue.mark_failed(&failed).await?;
        self.queue.mark_processed(&processed_ids).await?;

        Ok(claimed)
    }
}

/// Lets C6 (`pubsub-listener`) trigger a drain without depending on this
/// crate's internals — the listener only ever calls `drain()` and discards
/// the claimed count.
#[async_trait]
impl pubsub_listener::Drainer for MessageProcessor {
    async fn drain(&self) {
        if let Err(error) = MessageProcessor::drain(self).await {
            error!(%error, "drain failed");
        }
    }
}

/// Run every registered handler for `table` concurrently against the same
/// batch (§7: "fan-out is parallel within the batch", so one handler's
/// `onError` ids remain visible to the others). A handler panic is caught,
/// logged, and — unless `treat_unhandled_as_failures` is set — does not
/// mark any id failed on its own (§4.6 step 7, resolving the documented
/// Open Question).
async fn dispatch_table(
    table: &str,
    handlers: &[Arc<dyn ChangeHandler>],
    events: &[ChangeEvent],
    treat_unhandled_as_failures: bool,
) -> HashSet<i64> {
    let batch = ChangeBatch::new(events);
    let failed: Arc<Mutex<HashSet<i64>>> = Arc::new(Mutex::new(HashSet::new()));

    let calls = handlers.iter().map(|handler| {
        let failed = failed.clone();
        let batch = &batch;
        async move {
            let mut on_error = {
                let failed = failed.clone();
                move |ids: Vec<i64>| {
                    failed.lock().expect("failed-id set mutex poisoned").extend(ids);
                }
            };
            let outcome = AssertUnwindSafe(handler.process(batch, &mut on_error))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                error!(table, "handler panicked during dispatch");
                if treat_unhandled_as_failures {
                    let mut guard = failed.lock().expect("failed-id set mutex poisoned");
                    guard.extend(events.iter().map(|e| e.id()));
                }
            }
        }
    });

    join_all(calls).await;
    Arc::try_unwrap(failed)
        .map(|m| m.into_inner().expect("failed-id set mutex poisoned"))
        .unwrap_or_default()
}

/// Decode a queue row's stored payload into a handler-facing `ChangeEvent`
/// (§4.6 steps 2-4): attach metadata, remap columns to properties, and
/// compute `updatedFields` for UPDATE rows. `id` is replaced with the queue
/// row id — the trigger-emitted uuid in the raw payload is discarded.
fn decode_row(row: &QueueRow, discovery: &DiscoveryResult) -> Result<ChangeEvent, PubSubError> {
    let payload: QueuePayload =
        serde_json::from_value(row.payload.clone()).map_err(|source| PubSubError::Decode {
            id: row.id,
            source,
        })?;

    let metadata = ChangeMetadata {
        retry_count: row.retry_count,
        created_at: row.created_at,
    };

    let event = match payload {
        QueuePayload::Insert { schema, table, data, .. } => {
            let column_map = column_map_for(discovery, &table, row.id)?;
            ChangeEvent::Insert {
                id: row.id,
                schema,
                table,
                data: column_map.remap_to_props(&data),
                metadata,
            }
        }
        QueuePayload::Delete { schema, table, data, .. } => {
            let column_map = column_map_for(discovery, &table, row.id)?;
            ChangeEvent::Delete {
                id: row.id,
                schema,
                table,
                data: column_map.remap_to_props(&data),
                metadata,
            }
        }
        QueuePayload::Update { schema, table, data, .. } => {
            let column_map = column_map_for(discovery, &table, row.id)?;
            let new = column_map.remap_to_props(&data.new);
            let old = column_map.remap_to_props(&data.old);
            let updated_fields = updated_fields(&new, &old);
            ChangeEvent::Update {
                id: row.id,
                schema,
                table,
                data: UpdatedData { new, old, updated_fields },
                metadata,
            }
        }
    };

    Ok(event)
}

fn column_map_for<'a>(
    discovery: &'a DiscoveryResult,
    table_name: &str,
    row_id: i64,
) -> Result<&'a pubsub_hash::ColumnMap, PubSubError> {
    discovery
        .table_descriptor_for_table_name(table_name)
        .map(|descriptor| &descriptor.column_map)
        .ok_or_else(|| PubSubError::Decode {
            id: row_id,
            source: serde::de::Error::custom(format!("no table descriptor for {table_name:?}")),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use pubsub_discovery::{discover, HandlerRegistration, OrmMetadataProvider, TableDescriptor};
    use serde_json::json;

    struct FakeOrm;
    impl OrmMetadataProvider for FakeOrm {
        fn table_descriptor(&self, entity_target: &str) -> Option<TableDescriptor> {
            Some(TableDescriptor {
                database_schema: "public".to_string(),
                table_name: entity_target.to_string(),
                columns: vec!["id".to_string(), "user_name".to_string()],
                column_map: pubsub_hash::ColumnMap::new([(
                    "user_name".to_string(),
                    "userName".to_string(),
                )]),
            })
        }
    }

    struct RecordingHandler(Arc<Mutex<Vec<i64>>>);

    #[async_trait]
    impl ChangeHandler for RecordingHandler {
        async fn process(
            &self,
            changes: &ChangeBatch<'_>,
            _on_error: &mut (dyn FnMut(Vec<i64>) + Send),
        ) {
            let mut seen = self.0.lock().unwrap();
            seen.extend(changes.all.iter().map(|e| e.id()));
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl ChangeHandler for FailingHandler {
        async fn process(
            &self,
            changes: &ChangeBatch<'_>,
            on_error: &mut (dyn FnMut(Vec<i64>) + Send),
        ) {
            on_error(changes.all.iter().map(|e| e.id()).collect());
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl ChangeHandler for PanickingHandler {
        async fn process(&self, _changes: &ChangeBatch<'_>, _on_error: &mut (dyn FnMut(Vec<i64>) + Send)) {
            panic!("boom");
        }
    }

    fn insert_row(id: i64, table: &str) -> QueueRow {
        QueueRow {
            id,
            channel: "pubsub_trigger".to_string(),
            payload: json!({
                "event": "INSERT",
                "id": "11111111-1111-1111-1111-111111111111",
                "schema": "public",
                "table": table,
                "data": { "id": 1, "user_name": "ada" },
            }),
            created_at: Utc::now(),
            processed_at: None,
            retry_count: 0,
            next_retry_at: None,
            status: pubsub_schemas::QueueStatus::Processing,
        }
    }

    #[test]
    fn decode_row_replaces_payload_uuid_with_queue_row_id_and_remaps_columns() {
        let discovery = discover(
            vec![HandlerRegistration {
                entity_target: "users".to_string(),
                schema: None,
                event_mask: None,
                payload_fields: None,
                handler: Arc::new(RecordingHandler(Arc::new(Mutex::new(Vec::new())))),
            }],
            &FakeOrm,
            "public",
        )
        .unwrap();

        let row = insert_row(42, "users");
        let event = decode_row(&row, &discovery).unwrap();
        assert_eq!(event.id(), 42);
        match event {
            ChangeEvent::Insert { data, .. } => {
                assert_eq!(data["userName"], json!("ada"));
            }
            other => panic!("expected Insert, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_table_collects_onerror_ids_across_handlers() {
        let events = vec![ChangeEvent::Insert {
            id: 1,
            schema: "public".to_string(),
            table: "users".to_string(),
            data: json!({}),
            metadata: ChangeMetadata {
                retry_count: 0,
                created_at: Utc::now(),
            },
        }];
        let handlers: Vec<Arc<dyn ChangeHandler>> = vec![Arc::new(FailingHandler), Arc::new(RecordingHandler(Arc::new(Mutex::new(Vec::new()))))];
        let failed = dispatch_table("users", &handlers, &events, false).await;
        assert_eq!(failed, HashSet::from([1]));
    }

    #[tokio::test]
    async fn dispatch_table_without_treat_as_failures_swallows_panics() {
        let events = vec![ChangeEvent::Insert {
            id: 7,
            schema: "public".to_string(),
            table: "users".to_string(),
            data: json!({}),
            metadata: ChangeMetadata {
                retry_count: 0,
                created_at: Utc::now(),
            },
        }];
        let handlers: Vec<Arc<dyn ChangeHandler>> = vec![Arc::new(PanickingHandler)];
        let failed = dispatch_table("users", &handlers, &events, false).await;
        assert!(failed.is_empty());
    }

    #[tokio::test]
    async fn dispatch_table_with_treat_as_failures_marks_panicked_batch_failed() {
        let events = vec![ChangeEvent::Insert {
            id: 9,
            schema: "public".to_string(),
            table: "users".to_string(),
            data: json!({}),
            metadata: ChangeMetadata {
                retry_count: 0,
                created_at: Utc::now(),
            },
        }];
        let handlers: Vec<Arc<dyn ChangeHandler>> = vec![Arc::new(PanickingHandler)];
        let failed = dispatch_table("users", &handlers, &events, true).await;
        assert_eq!(failed, HashSet::from([9]));
    }
}
