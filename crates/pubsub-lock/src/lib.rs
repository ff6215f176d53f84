//! C2 — best-effort single-holder advisory lock across instances, built on
//! the DB's session-scoped advisory locks.

use pubsub_hash::advisory_lock_key;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tracing::{info, warn};

const DEFAULT_DURATION: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockOutcome {
    Acquired,
    Rejected,
}

/// Holds the pool used for `pg_try_advisory_lock`/`pg_advisory_unlock` calls
/// and the per-key release-timer map. Cheaply `Clone`-able (an `Arc` handle).
#[derive(Clone)]
pub struct AdvisoryLockService {
    pool: PgPool,
    releases: Arc<Mutex<HashMap<i32, tokio::task::JoinHandle<()>>>>,
}

impl AdvisoryLockService {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            releases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Attempt a non-blocking, session-scoped advisory lock identified by a
    /// deterministic hash of `key` (§4.1). `pg_try_advisory_lock` and the
    /// later `pg_advisory_unlock` must run on the same backend session, so a
    /// single connection is checked out of the pool and held for the whole
    /// lifetime of the lock rather than returned in between. On acquisition,
    /// schedules a release after `duration` — a missing or zero duration
    /// falls back to 10s — canceling any previously scheduled release for
    /// the same key first. The release is strictly time-based: it does not
    /// wait on, or get shortened by, whatever the caller does after
    /// acquiring the lock.
    pub async fn try_lock(&self, key: &str, duration: Option<Duration>) -> TryLockOutcome {
        let lock_id = advisory_lock_key(key);
        let duration = duration.filter(|d| !d.is_zero()).unwrap_or(DEFAULT_DURATION);

        let mut conn = match self.pool.acquire().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(key, lock_id, %error, "failed to check out a connection for advisory lock");
                return TryLockOutcome::Rejected;
            }
        };

        let acquired: Result<bool, sqlx::Error> =
            sqlx::query_scalar("select pg_try_advisory_lock($1)")
                .bind(lock_id)
                .fetch_one(&mut *conn)
                .await;

        match acquired {
            Ok(true) => {
                self.schedule_release(key.to_string(), lock_id, duration, conn).await;
                TryLockOutcome::Acquired
            }
            Ok(false) => {
                info!(key, lock_id, "advisory lock already held elsewhere");
                TryLockOutcome::Rejected
            }
            Err(error) => {
                warn!(key, lock_id, %error, "advisory lock acquisition failed");
                TryLockOutcome::Rejected
            }
        }
    }

    /// Owns `conn` — the same connection `pg_try_advisory_lock` just
    /// succeeded on — until the timer fires and `pg_advisory_unlock` runs on
    /// it too. The connection is only returned to the pool once unlocked.
    async fn schedule_release(
        &self,
        key: String,
        lock_id: i32,
        duration: Duration,
        mut conn: PoolConnection<Postgres>,
    ) {
        let mut releases = self.releases.lock().await;
        if let Some(previous) = releases.remove(&lock_id) {
            previous.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Err(error) = sqlx::query("select pg_advisory_unlock($1)")
                .bind(lock_id)
                .execute(&mut *conn)
                .await
            {
                warn!(key, lock_id, %error, "advisory lock release failed (connection likely lost)");
            }
        });
        releases.insert(lock_id, handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub const ENV_DB_URL: &str = "PUBSUB_DATABASE_URL";

    async fn make_pool() -> Option<PgPool> {
        let url = std::env::var(ENV_DB_URL).ok()?;
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(4)
            .connect(&url)
            .await
            .ok()
    }

    #[tokio::test]
    #[ignore = "requires PUBSUB_DATABASE_URL; run with --include-ignored"]
    async fn second_instance_is_rejected_while_first_holds_lock() {
        let Some(pool) = make_pool().await else {
            return;
        };
        let a = AdvisoryLockService::new(pool.clone());
        let b = AdvisoryLockService::new(pool);

        let first = a.try_lock("pg_pubsub_test", Some(Duration::from_secs(2))).await;
        assert_eq!(first, TryLockOutcome::Acquired);

        let second = b.try_lock("pg_pubsub_test", Some(Duration::from_secs(2))).await;
        assert_eq!(second, TryLockOutcome::Rejected);

        tokio::time::sleep(Duration::from_secs(3)).await;
        let third = b.try_lock("pg_pubsub_test", Some(Duration::from_secs(1))).await;
        assert_eq!(third, TryLockOutcome::Acquired);
    }

    #[tokio::test]
    #[ignore = "requires PUBSUB_DATABASE_URL; run with --include-ignored"]
    async fn relock_while_still_held_is_rejected_then_succeeds_once_the_holder_releases() {
        let Some(pool) = make_pool().await else {
            return;
        };
        let holder = AdvisoryLockService::new(pool.clone());
        let other = AdvisoryLockService::new(pool);

        assert_eq!(
            holder.try_lock("pg_pubsub_resched", Some(Duration::from_millis(100))).await,
            TryLockOutcome::Acquired
        );

        // `pg_try_advisory_lock` on a different backend session must be
        // rejected while the holder's session still owns the lock — this
        // would falsely succeed if acquire/release ran on different pooled
        // connections instead of the one session that actually holds it.
        assert_eq!(
            other.try_lock("pg_pubsub_resched", Some(Duration::from_millis(100))).await,
            TryLockOutcome::Rejected
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        // Once the holder's 100ms timer runs `pg_advisory_unlock` on its own
        // session, the key becomes available again.
        assert_eq!(
            other.try_lock("pg_pubsub_resched", Some(Duration::from_millis(100))).await,
            TryLockOutcome::Acquired
        );
    }
}
