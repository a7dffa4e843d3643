//! In-process counter store for single-instance deployments and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::clock::{Clock, SystemClock};
use super::store::{CounterStore, StoreError, StoreResult};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: i64,
}

/// A [`CounterStore`] kept in a concurrent map inside this process.
///
/// Entries expire lazily: an expired entry is dropped when it is next read,
/// and [`MemoryStore::purge_expired`] sweeps the rest.
pub struct MemoryStore {
    entries: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store whose TTLs are measured by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Drop every expired entry.
    pub fn purge_expired(&self) {
        let now = self.clock.now_millis();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_open()?;
        let now = self.clock.now_millis();

        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };

        if expired {
            trace!(key = %key, "Evicting expired entry");
            self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> StoreResult<()> {
        self.ensure_open()?;
        let ttl_ms = i64::try_from(ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let expires_at = self.clock.now_millis().saturating_add(ttl_ms);

        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn is_healthy(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> StoreResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.entries.clear();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
