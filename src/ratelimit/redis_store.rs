//! Redis-backed counter store shared by every API instance.
//!
//! The connection is opened in the background when the store is started and
//! reused by every request. If Redis is unreachable the store keeps
//! answering with errors (so limiters fail open) and retries the connection
//! on later calls. A failed attempt is shared: callers that queued behind it,
//! or arrive within the reconnect backoff, fail at once instead of each
//! opening their own attempt.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::store::{CounterStore, StoreError, StoreResult};
use crate::config::StoreConfig;

/// Outcome of the most recent failed connection attempt.
#[derive(Debug, Clone)]
struct ConnectFailure {
    at: Instant,
    reason: String,
}

/// A [`CounterStore`] backed by a Redis server.
pub struct RedisStore {
    client: redis::Client,
    connection: RwLock<Option<ConnectionManager>>,
    /// Serializes connection attempts so a burst of requests opens one connection.
    connect_gate: Mutex<()>,
    last_failure: RwLock<Option<ConnectFailure>>,
    closed: AtomicBool,
    connect_timeout: Duration,
    command_timeout: Duration,
    reconnect_backoff: Duration,
}

impl RedisStore {
    /// Create a store for the configured URL without connecting yet.
    ///
    /// Fails only if the URL cannot be parsed.
    pub fn new(config: &StoreConfig) -> StoreResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            connection: RwLock::new(None),
            connect_gate: Mutex::new(()),
            last_failure: RwLock::new(None),
            closed: AtomicBool::new(false),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            command_timeout: Duration::from_millis(config.command_timeout_ms),
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
        })
    }

    /// Create the store and start connecting in the background.
    ///
    /// A failed initial connection is logged and does not prevent the store
    /// from being used.
    pub fn start(config: &StoreConfig) -> StoreResult<Arc<Self>> {
        let store = Arc::new(Self::new(config)?);
        store.spawn_connect();
        Ok(store)
    }

    /// Attempt the connection on a background task.
    pub fn spawn_connect(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = store.connection().await {
                error!(
                    error = %e,
                    "Failed to connect to Redis; rate limiting will fail open until it is reachable"
                );
            }
        })
    }

    /// Whether a live connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }

        let cached = self.connection.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        self.check_backoff()?;

        let _gate = self.connect_gate.lock().await;

        // Another task may have connected, or failed to, while we waited.
        let cached = self.connection.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        self.check_backoff()?;

        debug!(timeout_ms = self.connect_timeout.as_millis() as u64, "Connecting to Redis");
        let attempt = match tokio::time::timeout(
            self.connect_timeout,
            ConnectionManager::new(self.client.clone()),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::Connection(e.to_string())),
            Err(_) => Err(StoreError::Timeout(self.connect_timeout.as_millis() as u64)),
        };

        match attempt {
            Ok(conn) => {
                *self.connection.write() = Some(conn.clone());
                *self.last_failure.write() = None;
                info!("Connected to Redis");
                Ok(conn)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    backoff_ms = self.reconnect_backoff.as_millis() as u64,
                    "Redis connection attempt failed"
                );
                *self.last_failure.write() = Some(ConnectFailure {
                    at: Instant::now(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Fail fast while the last connection attempt is within the backoff.
    fn check_backoff(&self) -> StoreResult<()> {
        match self.last_failure.read().as_ref() {
            Some(failure) if failure.at.elapsed() < self.reconnect_backoff => Err(
                StoreError::Connection(format!("reconnect backoff after: {}", failure.reason)),
            ),
            _ => Ok(()),
        }
    }

    async fn bounded<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.command_timeout, op).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout(self.command_timeout.as_millis() as u64)),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        self.bounded(conn.set_ex::<_, _, ()>(key, value, ttl_secs))
            .await
    }

    async fn is_healthy(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        let ping = async move {
            let pong: RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong
        };
        matches!(self.bounded(ping).await, Ok(ref pong) if pong == "PONG")
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        let _gate = self.connect_gate.lock().await;
        if self.connection.write().take().is_some() {
            info!("Redis connection closed");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
