//! C5 — trigger reconciliation: make the set of generated `plpgsql`
//! functions/triggers in the database match the set derived from
//! discovery (§4.4).

use pubsub_discovery::DiscoveryResult;
use pubsub_hash::ColumnMap;
use pubsub_lock::{AdvisoryLockService, TryLockOutcome};
use pubsub_schemas::{ChangeKind, PubSubConfig, PubSubError, ReconcileStrategy};
use sqlx::{PgPool, Row};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::info;

/// Reconciliation may only run while this advisory-lock key is held
/// (§4.4).
pub const RECONCILE_LOCK_KEY: &str = "pg_pubsub";
const RECONCILE_LOCK_DURATION: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct DesiredTrigger {
    schema: String,
    table: String,
    event_mask: HashSet<ChangeKind>,
    payload_fields: Option<Vec<String>>,
    column_map: ColumnMap,
}

#[derive(Debug, Clone)]
struct ExistingTrigger {
    schema: String,
    table: String,
    trigger_name: String,
}

pub struct TriggerService {
    pool: PgPool,
    lock: AdvisoryLockService,
    config: PubSubConfig,
}

impl TriggerService {
    pub fn new(pool: PgPool, lock: AdvisoryLockService, config: PubSubConfig) -> Self {
        Self { pool, lock, config }
    }

    /// Reconcile installed triggers against `discovery`'s desired set.
    /// Runs only while holding the `pg_pubsub` advisory lock; if another
    /// instance holds it, logs and returns without touching the database
    /// (§4.4, §6.5 scenario 6).
    pub async fn reconcile(&self, discovery: &DiscoveryResult) -> Result<(), PubSubError> {
        let outcome = self
            .lock
            .try_lock(RECONCILE_LOCK_KEY, Some(RECONCILE_LOCK_DURATION))
            .await;
        if outcome == TryLockOutcome::Rejected {
            info!("another instance is already updating PubSub triggers");
            return Ok(());
        }

        let desired = self.desired_triggers(discovery)?;
        match self.config.reconcile_strategy {
            ReconcileStrategy::AtomicReplace => self.reconcile_atomic_replace(&desired).await,
            ReconcileStrategy::DifferentialUpsert => {
                self.reconcile_differential_upsert(&desired).await
            }
        }
    }

    fn desired_triggers(&self, discovery: &DiscoveryResult) -> Result<Vec<DesiredTrigger>, PubSubError> {
        let mut desired = Vec::with_capacity(discovery.listeners.len());
        for (target, listener) in &discovery.listeners {
            let descriptor = discovery
                .tables_map
                .get(target)
                .ok_or_else(|| PubSubError::MissingMetadata(target.clone()))?;
            desired.push(DesiredTrigger {
                schema: listener.schema.clone(),
                table: descriptor.table_name.clone(),
                event_mask: listener.event_mask.clone(),
                payload_fields: listener.payload_fields.clone(),
                column_map: descriptor.column_map.clone(),
            });
        }
        Ok(desired)
    }

    async fn list_existing(&self) -> Result<Vec<ExistingTrigger>, PubSubError> {
        let like_pattern = format!("{}\\_%", self.config.trigger_prefix);
        let rows = sqlx::query(
            r#"
            select n.nspname as schema, c.relname as table_name, t.tgname as trigger_name
            from pg_trigger t
            join pg_class c on t.tgrelid = c.oid
            join pg_namespace n on c.relnamespace = n.oid
            where t.tgname like $1 escape '\'
              and not t.tgisinternal
            "#,
        )
        .bind(like_pattern)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(ExistingTrigger {
                    schema: row.try_get("schema")?,
                    table: row.try_get("table_name")?,
                    trigger_name: row.try_get("trigger_name")?,
                })
            })
            .collect()
    }

    /// Run the whole reconcile in one transaction: drop every installed
    /// trigger/function matching the prefix, then create every desired one.
    /// Zero window with missing triggers, at the cost of briefly locking
    /// every affected table (§4.4).
    async fn reconcile_atomic_replace(&self, desired: &[DesiredTrigger]) -> Result<(), PubSubError> {
        let existing = self.list_existing().await?;
        let mut tx = self.pool.begin().await?;

        for trigger in &existing {
            let function_name = self.function_name(&trigger.table);
            drop_trigger(&mut tx, &trigger.schema, &trigger.table, &trigger.trigger_name).await?;
            drop_function(&mut tx, &self.config.trigger_schema, &function_name).await?;
        }
        for trigger in desired {
            self.create_or_replace(&mut tx, trigger).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Create/replace every desired trigger first (each upsert is its own
    /// atomic statement pair), then drop whatever installed trigger has no
    /// desired counterpart. No table present both before and after
    /// reconfiguration is ever left without a trigger (§4.4).
    async fn reconcile_differential_upsert(
        &self,
        desired: &[DesiredTrigger],
    ) -> Result<(), PubSubError> {
        let existing = self.list_existing().await?;
        let desired_keys: HashSet<(String, String)> = desired
            .iter()
            .map(|d| (d.schema.clone(), d.table.clone()))
            .collect();

        for trigger in desired {
            let mut tx = self.pool.begin().await?;
            self.create_or_replace(&mut tx, trigger).await?;
            tx.commit().await?;
        }

        for trigger in &existing {
            if desired_keys.contains(&(trigger.schema.clone(), trigger.table.clone())) {
                continue;
            }
            let function_name = self.function_name(&trigger.table);
            let mut tx = self.pool.begin().await?;
            drop_trigger(&mut tx, &trigger.schema, &trigger.table, &trigger.trigger_name).await?;
            drop_function(&mut tx, &self.config.trigger_schema, &function_name).await?;
            tx.commit().await?;
        }

        Ok(())
    }

    async fn create_or_replace(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        trigger: &DesiredTrigger,
    ) -> Result<(), PubSubError> {
        let function_name = self.function_name(&trigger.table);
        let trigger_name = function_name.clone();

        let function_sql = build_function_sql(
            &self.config.trigger_schema,
            &function_name,
            &self.config.queue_table,
            &self.config.trigger_prefix,
            trigger,
        )?;
        sqlx::query(&function_sql).execute(&mut **tx).await?;

        let trigger_sql = build_trigger_sql(
            &trigger_name,
            &trigger.schema,
            &trigger.table,
            &self.config.trigger_schema,
            &function_name,
            &trigger.event_mask,
        )?;
        sqlx::query(&trigger_sql).execute(&mut **tx).await?;

        Ok(())
    }

    fn function_name(&self, table: &str) -> String {
        format!("{}_{}", self.config.trigger_prefix, table)
    }
}

async fn drop_trigger(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    schema: &str,
    table: &str,
    trigger_name: &str,
) -> Result<(), PubSubError> {
    let sql = format!(
        "drop trigger if exists {} on {}.{}",
        quote_ident(trigger_name)?,
        quote_ident(schema)?,
        quote_ident(table)?,
    );
    sqlx::query(&sql).execute(&mut **tx).await?;
    Ok(())
}

async fn drop_function(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    schema: &str,
    function_name: &str,
) -> Result<(), PubSubError> {
    let sql = format!(
        "drop function if exists {}.{}()",
        quote_ident(schema)?,
        quote_ident(function_name)?,
    );
    sqlx::query(&sql).execute(&mut **tx).await?;
    Ok(())
}

fn build_trigger_sql(
    trigger_name: &str,
    table_schema: &str,
    table: &str,
    function_schema: &str,
    function_name: &str,
    event_mask: &HashSet<ChangeKind>,
) -> Result<String, PubSubError> {
    let events = if event_mask.is_empty() {
        ChangeKind::ALL.iter().collect::<Vec<_>>()
    } else {
        ChangeKind::ALL.iter().filter(|k| event_mask.contains(k)).collect::<Vec<_>>()
    }
    .into_iter()
    .map(|k| k.as_sql().to_ascii_lowercase())
    .collect::<Vec<_>>()
    .join(" or ");

    Ok(format!(
        "create or replace trigger {} after {} on {}.{} for each row execute function {}.{}()",
        quote_ident(trigger_name)?,
        events,
        quote_ident(table_schema)?,
        quote_ident(table)?,
        quote_ident(function_schema)?,
        quote_ident(function_name)?,
    ))
}

fn build_function_sql(
    function_schema: &str,
    function_name: &str,
    queue_table: &str,
    prefix: &str,
    trigger: &DesiredTrigger,
) -> Result<String, PubSubError> {
    let insert_data = data_expr("NEW", &trigger.payload_fields, &trigger.column_map)?;
    let delete_data = data_expr("OLD", &trigger.payload_fields, &trigger.column_map)?;

    Ok(format!(
        r#"
        create or replace function {schema}.{func}()
        returns trigger as $$
        declare
            payload jsonb;
            new_id bigint;
        begin
            if tg_op = 'INSERT' then
                payload := jsonb_build_object(
                    'id', gen_random_uuid(),
                    'event', 'INSERT',
                    'schema', tg_table_schema,
                    'table', tg_table_name,
                    'data', {insert_data}
                );
            elsif tg_op = 'UPDATE' then
                payload := jsonb_build_object(
                    'id', gen_random_uuid(),
                    'event', 'UPDATE',
                    'schema', tg_table_schema,
                    'table', tg_table_name,
                    'data', jsonb_build_object('new', {insert_data}, 'old', {delete_data})
                );
            elsif tg_op = 'DELETE' then
                payload := jsonb_build_object(
                    'id', gen_random_uuid(),
                    'event', 'DELETE',
                    'schema', tg_table_schema,
                    'table', tg_table_name,
                    'data', {delete_data}
                );
            end if;

            insert into {queue_table} (channel, payload) values ('{prefix}', payload) returning id into new_id;
            perform pg_notify('{prefix}', new_id::text);

            if tg_op = 'DELETE' then
                return old;
            end if;
            return new;
        end;
        $$ language plpgsql;
        "#,
        schema = quote_ident(function_schema)?,
        func = quote_ident(function_name)?,
        insert_data = insert_data,
        delete_data = delete_data,
        queue_table = quote_ident(queue_table)?,
        prefix = prefix,
    ))
}

/// `data` is the full row (§4.4) unless the registration restricted it to
/// specific payload fields, in which case only the mapped database columns
/// are included.
fn data_expr(
    row_var: &str,
    payload_fields: &Option<Vec<String>>,
    column_map: &ColumnMap,
) -> Result<String, PubSubError> {
    match payload_fields {
        None => Ok(format!("to_jsonb({row_var})")),
        Some(fields) => {
            let mut parts = Vec::with_capacity(fields.len());
            for prop in fields {
                let column = column_map.column_for_prop(prop).unwrap_or(prop.as_str());
                let quoted = quote_ident(column)?;
                parts.push(format!("'{column}', {row_var}.{quoted}"));
            }
            Ok(format!("jsonb_build_object({})", parts.join(", ")))
        }
    }
}

/// Double-quote an identifier for safe interpolation. Rejects embedded
/// double quotes instead of escaping them, since every identifier here
/// comes from operator configuration or ORM metadata, never request input.
fn quote_ident(name: &str) -> Result<String, PubSubError> {
    if name.is_empty() || name.contains('"') {
        return Err(PubSubError::Configuration(format!(
            "invalid identifier {name:?}"
        )));
    }
    Ok(format!("\"{name}\""))
}
