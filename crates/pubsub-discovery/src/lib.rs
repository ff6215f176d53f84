//! C3 — handler discovery: collect handler registrations, ask the ORM for
//! each target's metadata, and produce the merged per-table records that
//! drive trigger reconciliation (C5) and dispatch (C7).

use async_trait::async_trait;
use pubsub_hash::ColumnMap;
use pubsub_schemas::{merge_event_masks, merge_payload_fields, ChangeEvent, ChangeKind, PubSubError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A handler-supplied view over one drain's changes for one table (§4.6
/// step 6): the full sorted-by-id slice plus the three event-kind filtered
/// views, each preserving the ascending `id` order of `all`.
pub struct ChangeBatch<'a> {
    pub all: &'a [ChangeEvent],
    pub insert: Vec<&'a ChangeEvent>,
    pub update: Vec<&'a ChangeEvent>,
    pub delete: Vec<&'a ChangeEvent>,
}

impl<'a> ChangeBatch<'a> {
    pub fn new(all: &'a [ChangeEvent]) -> Self {
        let insert = all.iter().filter(|e| e.kind() == ChangeKind::Insert).collect();
        let update = all.iter().filter(|e| e.kind() == ChangeKind::Update).collect();
        let delete = all.iter().filter(|e| e.kind() == ChangeKind::Delete).collect();
        Self {
            all,
            insert,
            update,
            delete,
        }
    }
}

/// User-supplied handler: `process(changes, onError)` (§6.3). `on_error`
/// may be called zero or more times with ids that should be marked failed;
/// ids never reported stay eligible for `markAsProcessed` once every
/// handler in the fan-out list has run (§4.6 step 8).
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn process(&self, changes: &ChangeBatch<'_>, on_error: &mut (dyn FnMut(Vec<i64>) + Send));
}

/// One handler registration as the application submits it (§3.1), before
/// merging.
pub struct HandlerRegistration {
    pub entity_target: String,
    pub schema: Option<String>,
    pub event_mask: Option<HashSet<ChangeKind>>,
    pub payload_fields: Option<Vec<String>>,
    pub handler: Arc<dyn ChangeHandler>,
}

/// Per-table descriptor derived from the ORM at discovery time (§3.2).
#[derive(Clone)]
pub struct TableDescriptor {
    pub database_schema: String,
    pub table_name: String,
    pub columns: Vec<String>,
    pub column_map: ColumnMap,
}

/// Stands in for "ask the ORM for this target's metadata" (§4.2). A real
/// integration implements this over whatever ORM/entity registry the host
/// application uses; it is the one seam spec.md explicitly leaves external.
pub trait OrmMetadataProvider: Send + Sync {
    fn table_descriptor(&self, entity_target: &str) -> Option<TableDescriptor>;
}

/// Merged per-table record (§3.1): schema falls back to the configured
/// default, event masks and payload fields are set-unioned, handler
/// instances are appended in discovery order.
pub struct MergedListener {
    pub schema: String,
    pub event_mask: HashSet<ChangeKind>,
    pub payload_fields: Option<Vec<String>>,
    pub handlers: Vec<Arc<dyn ChangeHandler>>,
}

pub struct DiscoveryResult {
    pub tables_map: HashMap<String, TableDescriptor>,
    pub listeners: HashMap<String, MergedListener>,
}

impl DiscoveryResult {
    pub fn listeners_map(&self) -> HashMap<String, Vec<Arc<dyn ChangeHandler>>> {
        self.listeners
            .iter()
            .map(|(table, listener)| (table.clone(), listener.handlers.clone()))
            .collect()
    }

    /// Look up the merged listener for a raw database table name (as it
    /// appears in a trigger-emitted payload), as opposed to the entity
    /// target string used as the key in `listeners`/`tables_map`.
    pub fn listener_for_table_name(&self, table_name: &str) -> Option<&MergedListener> {
        let target = self.target_for_table_name(table_name)?;
        self.listeners.get(target)
    }

    /// Same lookup, for the table descriptor (column map) instead of the
    /// merged listener.
    pub fn table_descriptor_for_table_name(&self, table_name: &str) -> Option<&TableDescriptor> {
        let target = self.target_for_table_name(table_name)?;
        self.tables_map.get(target)
    }

    fn target_for_table_name(&self, table_name: &str) -> Option<&str> {
        self.tables_map
            .iter()
            .find(|(_, descriptor)| descriptor.table_name == table_name)
            .map(|(target, _)| target.as_str())
    }
}

struct PendingListener {
    schema: Option<String>,
    event_mask: Option<HashSet<ChangeKind>>,
    payload_fields: Option<Vec<String>>,
    handlers: Vec<Arc<dyn ChangeHandler>>,
}

/// Run discovery once at startup (§4.2). Fails fast, naming the target,
/// when the ORM has no metadata for a registered entity.
pub fn discover(
    registrations: Vec<HandlerRegistration>,
    orm: &dyn OrmMetadataProvider,
    default_schema: &str,
) -> Result<DiscoveryResult, PubSubError> {
    let mut tables_map: HashMap<String, TableDescriptor> = HashMap::new();
    let mut pending: HashMap<String, PendingListener> = HashMap::new();

    for registration in registrations {
        let descriptor = orm
            .table_descriptor(&registration.entity_target)
            .ok_or_else(|| PubSubError::MissingMetadata(registration.entity_target.clone()))?;
        tables_map
            .entry(registration.entity_target.clone())
            .or_insert(descriptor);

        let entry = pending
            .entry(registration.entity_target.clone())
            .or_insert_with(|| PendingListener {
                schema: None,
                event_mask: None,
                payload_fields: None,
                handlers: Vec::new(),
            });

        entry.schema = entry.schema.take().or(registration.schema);
        entry.event_mask = merge_event_masks(entry.event_mask.take(), registration.event_mask);
        entry.payload_fields =
            merge_payload_fields(entry.payload_fields.take(), registration.payload_fields);
        entry.handlers.push(registration.handler);
    }

    let listeners = pending
        .into_iter()
        .map(|(table, pending)| {
            let schema = pending.schema.unwrap_or_else(|| default_schema.to_string());
            let event_mask = pending
                .event_mask
                .unwrap_or_else(|| HashSet::from(ChangeKind::ALL));
            (
                table,
                MergedListener {
                    schema,
                    event_mask,
                    payload_fields: pending.payload_fields,
                    handlers: pending.handlers,
                },
            )
        })
        .collect();

    Ok(DiscoveryResult {
        tables_map,
        listeners,
    })
}

/// Empty JSON object entity — the constructor thunk §3.2 describes,
/// collapsed to a JSON value since this port has no compile-time typed
/// entity per table.
pub fn empty_entity() -> Value {
    Value::Object(serde_json::Map::new())
}
