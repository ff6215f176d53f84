//! C6 — the hybrid listener: a dedicated NOTIFY connection plus a fallback
//! timer, driving drains of the queue service (§4.5, §4.6).

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Fallback drain period, unrelated to load (§4.6).
pub const FALLBACK_INTERVAL: Duration = Duration::from_secs(60);

/// Something that can drain the queue once — in practice the combination of
/// C4's `claim_batch` and C7's decode/dispatch. The listener only knows
/// when to call it, never how it works.
#[async_trait]
pub trait Drainer: Send + Sync {
    async fn drain(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Connecting,
    Listening,
    Paused,
}

struct RunningTasks {
    notify_loop: JoinHandle<()>,
    fallback_loop: JoinHandle<()>,
}

impl Drop for RunningTasks {
    fn drop(&mut self) {
        self.notify_loop.abort();
        self.fallback_loop.abort();
    }
}

/// Drives one NOTIFY channel through the `stopped → connecting → listening`
/// lifecycle, with `pause()`/`resume()` moving to and from `paused` (§4.5).
pub struct HybridListener {
    pool: PgPool,
    channel: String,
    drainer: Arc<dyn Drainer>,
    state: Arc<RwLock<ListenerState>>,
    tasks: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl HybridListener {
    pub fn new(pool: PgPool, channel: impl Into<String>, drainer: Arc<dyn Drainer>) -> Self {
        Self {
            pool,
            channel: channel.into(),
            drainer,
            state: Arc::new(RwLock::new(ListenerState::Stopped)),
            tasks: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn state(&self) -> ListenerState {
        *self.state.read().await
    }

    /// `stopped → connecting → listening`. Performs one immediate drain
    /// before subscribing, so nothing queued before startup waits for a
    /// notification (§4.6 Activation).
    pub async fn start(&self) -> Result<(), sqlx::Error> {
        *self.state.write().await = ListenerState::Connecting;
        self.activate().await
    }

    /// Unsubscribes and closes the NOTIFY connection, moving to `paused`.
    /// Drains already in flight are not interrupted; only future
    /// notification- and fallback-triggered drains stop firing.
    pub async fn pause(&self) {
        *self.tasks.lock().await = None;
        *self.state.write().await = ListenerState::Paused;
    }

    /// Re-establishes the NOTIFY connection and returns to `listening` once
    /// connected, including the catch-up immediate drain (§4.6).
    pub async fn resume(&self) -> Result<(), sqlx::Error> {
        *self.state.write().await = ListenerState::Connecting;
        self.activate().await
    }

    /// `pause()` → `await f()` → `resume()`, with `resume` run on every exit
    /// path from `f` (§4.5).
    pub async fn suspend_and_run<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        self.pause().await;
        let result = f().await;
        if let Err(error) = self.resume().await {
            warn!(%error, "listener failed to resume after suspendAndRun");
        }
        result
    }

    /// Raw NOTIFY fan-in for application-defined channels outside the
    /// configured prefix (§4.5). Independent of the `stopped`/`paused`
    /// state machine above: callers manage the returned handle themselves.
    pub fn subscribe(
        &self,
        channel: impl Into<String>,
        callback: Arc<dyn Fn(String) + Send + Sync>,
    ) -> JoinHandle<()> {
        let pool = self.pool.clone();
        let channel = channel.into();
        tokio::spawn(async move {
            let mut listener = reconnect(&pool, &channel).await;
            loop {
                match listener.recv().await {
                    Ok(notification) => callback(notification.payload().to_string()),
                    Err(error) => {
                        warn!(%error, channel, "raw subscription connection lost, reconnecting");
                        listener = reconnect(&pool, &channel).await;
                    }
                }
            }
        })
    }

    async fn activate(&self) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        *self.state.write().await = ListenerState::Listening;

        self.drainer.drain().await;

        let notify_loop = tokio::spawn(run_notify_loop(
            self.pool.clone(),
            self.channel.clone(),
            listener,
            self.drainer.clone(),
        ));
        let fallback_loop = tokio::spawn(run_fallback_loop(self.drainer.clone()));

        *self.tasks.lock().await = Some(RunningTasks {
            notify_loop,
            fallback_loop,
        });
        Ok(())
    }
}

/// Exponential reconnect backoff, capped at 30s, retried indefinitely
/// (§4.5).
fn backoff_ms(attempt: u32) -> u64 {
    1000u64.saturating_mul(1u64 << attempt.min(5)).min(30_000)
}

async fn run_notify_loop(
    pool: PgPool,
    channel: String,
    mut listener: PgListener,
    drainer: Arc<dyn Drainer>,
) {
    loop {
        match listener.recv().await {
            Ok(_notification) => {
                let drainer = drainer.clone();
                tokio::spawn(async move { drainer.drain().await });
            }
            Err(error) => {
                warn!(%error, "notify connection lost, reconnecting");
                listener = reconnect(&pool, &channel).await;
            }
        }
    }
}

async fn reconnect(pool: &PgPool, channel: &str) -> PgListener {
    let mut attempt = 0u32;
    loop {
        match PgListener::connect_with(pool).await {
            Ok(mut candidate) => match candidate.listen(channel).await {
                Ok(()) => {
                    info!(attempt, "listener reconnected");
                    return candidate;
                }
                Err(error) => warn!(%error, attempt, "listen() failed during reconnect"),
            },
            Err(error) => warn!(%error, attempt, "connect failed during reconnect"),
        }
        tokio::time::sleep(Duration::from_millis(backoff_ms(attempt))).await;
        attempt += 1;
    }
}

async fn run_fallback_loop(drainer: Arc<dyn Drainer>) {
    let mut ticker = tokio::time::interval(FALLBACK_INTERVAL);
    loop {
        ticker.tick().await;
        drainer.drain().await;
    }
}
