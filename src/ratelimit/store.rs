//! Counter store trait for abstracting the shared and in-process backends.

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised while talking to a counter store.
///
/// Every variant is treated the same way on the request path: the limiter
/// logs it and lets the request through.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("store operation timed out after {0}ms")]
    Timeout(u64),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("malformed window record: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("store has been closed")]
    Closed,
}

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value store with expiring entries holding serialized window records.
///
/// Implementations are shared by every limiter and every concurrent request,
/// so they must be safe for concurrent use.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Fetch the serialized value stored under `key`, if any.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Store `value` under `key`, expiring after `ttl_secs` seconds.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()>;

    /// Whether the store is currently reachable.
    async fn is_healthy(&self) -> bool {
        true
    }

    /// Release the underlying connection. Later calls fail with [`StoreError::Closed`].
    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }

    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}
