//! Shared test fixtures: a migrated queue table plus a small representative
//! source table, direct-SQL seeding that bypasses the CDC trigger entirely,
//! and assertion helpers for queue-row state (consumed only from other
//! crates' `[dev-dependencies]` — never ships in a production build).

use pubsub_queue::QueueService;
use pubsub_schemas::{PubSubConfig, PubSubError, QueueStatus};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

/// Preferred environment variable; falls back to `PUBSUB_DATABASE_URL` so
/// the same database used by other crates' `#[ignore]`-gated tests works
/// here too.
pub const ENV_DB_URL: &str = "PUBSUB_TEST_DATABASE_URL";

#[derive(Debug, thiserror::Error)]
pub enum TestkitError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    PubSub(#[from] PubSubError),
    #[error("unrecognized queue status {0:?}")]
    UnrecognizedStatus(String),
}

/// One isolated test database: a connection pool plus uniquely-suffixed
/// queue and source table names, so parallel `#[tokio::test]`s never
/// collide.
pub struct TestDatabase {
    pub pool: PgPool,
    pub config: PubSubConfig,
    pub widgets_table: String,
}

impl TestDatabase {
    /// Connect using `PUBSUB_TEST_DATABASE_URL`/`PUBSUB_DATABASE_URL`, or
    /// return `None` so callers can skip gracefully without a database —
    /// the same pattern every `#[ignore]`-gated integration test in this
    /// workspace already follows.
    pub async fn connect() -> Option<Self> {
        let url = std::env::var(ENV_DB_URL)
            .or_else(|_| std::env::var("PUBSUB_DATABASE_URL"))
            .ok()?;
        let pool = PgPoolOptions::new().max_connections(4).connect(&url).await.ok()?;
        let suffix = uuid::Uuid::new_v4().simple().to_string();

        let mut config = PubSubConfig::default();
        config.queue_table = format!("pubsub_testkit_queue_{suffix}");
        let widgets_table = format!("pubsub_testkit_widgets_{suffix}");

        Some(Self { pool, config, widgets_table })
    }

    /// Idempotently create the queue table (via the real `QueueService`,
    /// so fixtures never drift from production DDL) plus a small
    /// representative source table (`id`, `name`, `email`).
    pub async fn migrate(&self) -> Result<QueueService, TestkitError> {
        let queue = QueueService::new(self.pool.clone(), self.config.clone())?;
        queue.setup().await?;
        sqlx::query(&format!(
            "create table if not exists {table} (id bigserial primary key, name text not null, email text not null)",
            table = self.widgets_table
        ))
        .execute(&self.pool)
        .await?;
        Ok(queue)
    }

    /// Drop both fixture tables. A convenience for local runs; CI databases
    /// are typically thrown away wholesale.
    pub async fn teardown(&self) -> Result<(), TestkitError> {
        sqlx::query(&format!("drop table if exists {}", self.config.queue_table))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!("drop table if exists {}", self.widgets_table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert a row directly into the widgets fixture table, bypassing any
    /// CDC trigger entirely — for tests that need source data to exist
    /// without exercising C5's generated trigger.
    pub async fn insert_widget(&self, name: &str, email: &str) -> Result<i64, TestkitError> {
        let row: (i64,) = sqlx::query_as(&format!(
            "insert into {} (name, email) values ($1, $2) returning id",
            self.widgets_table
        ))
        .bind(name)
        .bind(email)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Seed a queue row with a crafted INSERT payload (§3.5), skipping the
    /// trigger entirely — for processor/handler tests that want a known
    /// queue state without installing C5's trigger.
    pub async fn seed_insert_event(&self, table: &str, data: Value) -> Result<i64, TestkitError> {
        let payload = json!({
            "event": "INSERT",
            "id": uuid::Uuid::new_v4(),
            "schema": "public",
            "table": table,
            "data": data,
        });
        self.seed_raw(payload).await
    }

    /// Seed a queue row with a crafted UPDATE payload.
    pub async fn seed_update_event(&self, table: &str, new: Value, old: Value) -> Result<i64, TestkitError> {
        let payload = json!({
            "event": "UPDATE",
            "id": uuid::Uuid::new_v4(),
            "schema": "public",
            "table": table,
            "data": {"new": new, "old": old},
        });
        self.seed_raw(payload).await
    }

    async fn seed_raw(&self, payload: Value) -> Result<i64, TestkitError> {
        let row: (i64,) = sqlx::query_as(&format!(
            "insert into {} (channel, payload) values ($1, $2) returning id",
            self.config.queue_table
        ))
        .bind(&self.config.trigger_prefix)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    /// Read back a queue row's current status (§3.3), for assertions.
    pub async fn queue_status(&self, id: i64) -> Result<QueueStatus, TestkitError> {
        let row = sqlx::query(&format!("select status from {} where id = $1", self.config.queue_table))
            .bind(id)
            .fetch_one(&self.pool)
            .await?;
        let status_text: String = row.try_get("status")?;
        QueueStatus::from_sql(&status_text).ok_or(TestkitError::UnrecognizedStatus(status_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires PUBSUB_TEST_DATABASE_URL; run with --include-ignored"]
    async fn seeded_insert_event_is_claimable_and_markable_processed() {
        let Some(db) = TestDatabase::connect().await else {
            return;
        };
        let queue = db.migrate().await.unwrap();

        let widget_id = db.insert_widget("ada", "ada@example.com").await.unwrap();
        let queue_id = db
            .seed_insert_event("widgets", json!({"id": widget_id, "name": "ada"}))
            .await
            .unwrap();

        let claimed = queue.claim_batch(&db.config.trigger_prefix, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, queue_id);

        queue.mark_processed(&[queue_id]).await.unwrap();
        assert_eq!(db.queue_status(queue_id).await.unwrap(), QueueStatus::Processed);

        db.teardown().await.unwrap();
    }
}
