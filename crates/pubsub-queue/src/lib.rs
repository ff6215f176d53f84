//! C4 — the durable message queue table: setup, FIFO claim via
//! `SKIP LOCKED`, processed/failed marking with exponential backoff, and
//! TTL-based cleanup.

use pubsub_schemas::{PubSubConfig, PubSubError, QueueRow, QueueStatus};
use sqlx::{PgPool, Row};
use std::time::Duration as StdDuration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Visibility deadline written at claim time (§4.3): if a process dies
/// mid-processing, another process may re-claim after this window.
const CLAIM_VISIBILITY: StdDuration = StdDuration::from_secs(5 * 60);

/// Bounded batch size — the only queue-side backpressure (§4.6).
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Per-status row counts (see [`QueueService::stats`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub processed: i64,
    pub failed: i64,
}

/// Operations against the queue table named in `config.queue_table`
/// (§3.3, §4.3). Table/column identifiers come from operator configuration,
/// never from user input, but are still validated before being spliced into
/// SQL since `sqlx` has no bind-parameter support for identifiers.
#[derive(Clone)]
pub struct QueueService {
    pool: PgPool,
    config: PubSubConfig,
}

impl QueueService {
    pub fn new(pool: PgPool, config: PubSubConfig) -> Result<Self, PubSubError> {
        validate_identifier(&config.queue_table)?;
        Ok(Self { pool, config })
    }

    /// Idempotently create the queue table and its three secondary indexes
    /// (`status`, `channel`, `next_retry_at`) (§4.3 Setup).
    pub async fn setup(&self) -> Result<(), PubSubError> {
        let table = &self.config.queue_table;
        sqlx::query(&format!(
            r#"
            create table if not exists {table} (
                id bigserial primary key,
                channel text not null,
                payload jsonb not null,
                created_at timestamptz not null default now(),
                processed_at timestamptz,
                retry_count integer not null default 0,
                next_retry_at timestamptz,
                status text not null default 'pending'
            )
            "#
        ))
        .execute(&self.pool)
        .await?;

        for (name, column) in [
            ("status", "status"),
            ("channel", "channel"),
            ("next_retry_at", "next_retry_at"),
        ] {
            sqlx::query(&format!(
                "create index if not exists {table}_{name}_idx on {table} ({column})"
            ))
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Atomically claim up to `batch_size` eligible rows for `channel`
    /// (§4.3): pending rows, or failed rows still within their retry budget
    /// whose backoff has elapsed. `ORDER BY id ASC FOR UPDATE SKIP LOCKED`
    /// lets concurrent instances claim disjoint batches without blocking.
    /// Claimed rows get a 5 minute visibility deadline.
    pub async fn claim_batch(
        &self,
        channel: &str,
        batch_size: i64,
    ) -> Result<Vec<QueueRow>, PubSubError> {
        let table = &self.config.queue_table;
        let rows = sqlx::query(&format!(
            r#"
            with to_claim as (
                select id
                from {table}
                where channel = $1
                  and (
                    status = 'pending'
                    or (status = 'failed' and retry_count < $2 and next_retry_at <= now())
                  )
                order by id asc
                limit $3
                for update skip locked
            )
            update {table}
               set status = 'processing',
                   next_retry_at = now() + make_interval(secs => $4::double precision)
             where id in (select id from to_claim)
            returning id, channel, payload, created_at, processed_at, retry_count,
                      next_retry_at, status
            "#
        ))
        .bind(channel)
        .bind(self.config.max_retries)
        .bind(batch_size)
        .bind(CLAIM_VISIBILITY.as_secs() as f64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_queue_row).collect()
    }

    /// Mark rows `processed` (§4.3).
    pub async fn mark_processed(&self, ids: &[i64]) -> Result<(), PubSubError> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = &self.config.queue_table;
        sqlx::query(&format!(
            "update {table} set status = 'processed', processed_at = now() where id = any($1)"
        ))
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Mark rows `failed`, incrementing `retry_count` and scheduling the
    /// next retry with exponential backoff capped by retry exhaustion
    /// (§4.3): `next_retry_at = now + 1min * 2^retry_count`, or `null` once
    /// `retry_count >= max_retries`.
    pub async fn mark_failed(&self, ids: &[i64]) -> Result<(), PubSubError> {
        if ids.is_empty() {
            return Ok(());
        }
        let table = &self.config.queue_table;
        sqlx::query(&format!(
            r#"
            update {table}
               set status = 'failed',
                   retry_count = retry_count + 1,
                   next_retry_at = case
                       when retry_count + 1 >= $2 then null
                       else now() + make_interval(mins => 1 * power(2, least(retry_count + 1, 20))::int)
                   end
             where id = any($1)
            "#
        ))
        .bind(ids)
        .bind(self.config.max_retries)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete rows matching the TTL predicate in §3.3: processed rows older
    /// than `processed_at + ttl`, or exhausted-retry failed rows older than
    /// `created_at + ttl`. Returns the number of rows deleted.
    pub async fn cleanup(&self) -> Result<u64, PubSubError> {
        let table = &self.config.queue_table;
        let ttl_seconds = self.config.message_ttl.num_seconds();
        let result = sqlx::query(&format!(
            r#"
            delete from {table}
             where (status = 'processed' and processed_at < now() - make_interval(secs => $1))
                or (status = 'failed' and retry_count >= $2 and created_at < now() - make_interval(secs => $1))
            "#
        ))
        .bind(ttl_seconds as f64)
        .bind(self.config.max_retries)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Per-status row counts, for operator visibility (`pubsub-cli
    /// queue-stats`). Not part of spec §4.3 proper; a read-only convenience
    /// built the same way the rest of this service queries the table.
    pub async fn stats(&self) -> Result<QueueStats, PubSubError> {
        let table = &self.config.queue_table;
        let row = sqlx::query(&format!(
            r#"
            select
                count(*) filter (where status = 'pending') as pending,
                count(*) filter (where status = 'processing') as processing,
                count(*) filter (where status = 'processed') as processed,
                count(*) filter (where status = 'failed') as failed
            from {table}
            "#
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(QueueStats {
            pending: row.try_get::<i64, _>("pending")?,
            processing: row.try_get::<i64, _>("processing")?,
            processed: row.try_get::<i64, _>("processed")?,
            failed: row.try_get::<i64, _>("failed")?,
        })
    }

    /// Spawn the periodic cleanup timer (§4.3 Setup). The returned handle
    /// should be aborted on teardown.
    pub fn spawn_cleanup_timer(&self) -> JoinHandle<()> {
        let service = self.clone();
        let interval = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match service.cleanup().await {
                    Ok(deleted) if deleted > 0 => info!(deleted, "queue cleanup removed rows"),
                    Ok(_) => {}
                    Err(error) => warn!(%error, "queue cleanup failed"),
                }
            }
        })
    }
}

fn row_to_queue_row(row: sqlx::postgres::PgRow) -> Result<QueueRow, PubSubError> {
    let status_text: String = row.try_get("status")?;
    let id: i64 = row.try_get("id")?;
    let status = QueueStatus::from_sql(&status_text).ok_or_else(|| {
        PubSubError::Configuration(format!(
            "row {id}: unrecognized queue status {status_text:?}"
        ))
    })?;
    Ok(QueueRow {
        id,
        channel: row.try_get("channel")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        retry_count: row.try_get("retry_count")?,
        next_retry_at: row.try_get("next_retry_at")?,
        status,
    })
}

/// Table/column names come from configuration, not request bodies, but are
/// still checked before being spliced into SQL.
fn validate_identifier(name: &str) -> Result<(), PubSubError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false)
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PubSubError::Configuration(format!(
            "invalid queue table identifier {name:?}"
        )))
    }
}
