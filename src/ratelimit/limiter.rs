//! Core fixed-window rate limiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, error, trace};

use super::clock::{Clock, SystemClock};
use super::key::{KeyGenerator, NamespacedKey, RequestContext};
use super::record::{ttl_secs, WindowRecord};
use super::store::{CounterStore, StoreResult};

/// Machine-readable code carried by every throttled response.
pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";

/// Message used when a limiter is not given one.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Default quota when no specific limit is configured.
const DEFAULT_LIMIT: u64 = 100;
/// Default window when no specific window is configured.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Configuration for a rate limiter.
#[derive(Debug, Clone)]
pub struct LimitConfig {
    /// Name used in logs
    pub name: String,
    /// Length of each fixed window
    pub window: Duration,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Human-readable text returned to throttled callers
    pub message: String,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_LIMIT,
            message: DEFAULT_MESSAGE.to_string(),
        }
    }
}

/// Quota metadata for an allowed request.
///
/// Inserted into the request for downstream handlers and rendered as the
/// `X-RateLimit-*` response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub limit: u64,
    pub current: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

impl RateLimitInfo {
    fn new(record: &WindowRecord, limit: u64) -> Self {
        Self {
            limit,
            current: record.count,
            remaining: record.remaining(limit),
            reset_time: record.reset_at(),
        }
    }

    /// The reset instant as ISO-8601 with millisecond precision.
    pub fn reset_iso8601(&self) -> String {
        self.reset_time.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

/// Details of a throttled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Throttled {
    pub info: RateLimitInfo,
    /// Seconds until the window resets
    pub retry_after: u64,
    pub message: String,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Within quota; forward the request.
    Allow(RateLimitInfo),
    /// Over quota; reject without forwarding.
    Throttle(Throttled),
    /// The store could not be used; forward the request without quota metadata.
    FailOpen,
}

impl Decision {
    pub fn is_throttled(&self) -> bool {
        matches!(self, Decision::Throttle(_))
    }

    /// Quota metadata for this decision, if any was computed.
    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            Decision::Allow(info) => Some(info),
            Decision::Throttle(throttled) => Some(&throttled.info),
            Decision::FailOpen => None,
        }
    }
}

/// A fixed-window rate limiter whose counters live in a shared store.
///
/// Each check reads the key's window record, advances it and writes it
/// back. The read and the write are separate round trips, so concurrent
/// requests for the same key may overwrite each other's increments.
pub struct RateLimiter {
    config: LimitConfig,
    store: Arc<dyn CounterStore>,
    key_generator: Arc<dyn KeyGenerator>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a rate limiter using the default key rule and the system clock.
    pub fn new(config: LimitConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            config,
            store,
            key_generator: Arc::new(NamespacedKey::default()),
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace how quota keys are derived from requests.
    pub fn with_key_generator<G>(mut self, generator: G) -> Self
    where
        G: KeyGenerator + 'static,
    {
        self.key_generator = Arc::new(generator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// The quota key this limiter uses for a request.
    pub fn key_for(&self, ctx: &RequestContext) -> String {
        self.key_generator.generate(ctx)
    }

    /// Count a request and decide whether it may proceed.
    pub async fn check(&self, ctx: &RequestContext) -> Decision {
        let key = self.key_for(ctx);
        self.check_key(&key).await
    }

    /// Count a request against `key` and decide whether it may proceed.
    ///
    /// Store failures never propagate: they are logged and the request is
    /// let through as [`Decision::FailOpen`].
    pub async fn check_key(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();

        trace!(
            limiter = %self.config.name,
            key = %key,
            "Checking rate limit"
        );

        let record = match self.record_hit(key, now).await {
            Ok(record) => record,
            Err(e) => {
                error!(
                    limiter = %self.config.name,
                    key = %key,
                    error = %e,
                    "Rate limit store unavailable, allowing request"
                );
                return Decision::FailOpen;
            }
        };

        let limit = self.config.max_requests;
        let info = RateLimitInfo::new(&record, limit);

        if record.count > limit {
            debug!(
                limiter = %self.config.name,
                key = %key,
                count = record.count,
                limit = limit,
                "Rate limit exceeded"
            );
            return Decision::Throttle(Throttled {
                info,
                retry_after: record.retry_after_secs(now),
                message: self.config.message.clone(),
            });
        }

        Decision::Allow(info)
    }

    /// Read the count for `key` in its current window without counting a request.
    ///
    /// Returns `None` if the key has no live window.
    pub async fn current_count(&self, key: &str) -> StoreResult<Option<u64>> {
        let now = self.clock.now_millis();
        let record = self.load(key).await?;
        Ok(record
            .filter(|record| !record.is_expired(now))
            .map(|record| record.count))
    }

    /// Close the underlying store.
    ///
    /// The store may be shared with other limiters; closing it affects all of them.
    pub async fn shutdown(&self) -> StoreResult<()> {
        self.store.close().await
    }

    async fn load(&self, key: &str) -> StoreResult<Option<WindowRecord>> {
        self.store
            .get(key)
            .await?
            .map(|raw| WindowRecord::decode(&raw))
            .transpose()
    }

    async fn record_hit(&self, key: &str, now: i64) -> StoreResult<WindowRecord> {
        let existing = self.load(key).await?;
        let record = WindowRecord::advance(existing, now, self.config.window);

        if record.count == 1 {
            debug!(
                limiter = %self.config.name,
                key = %key,
                reset_time = record.reset_time,
                "Opening new rate limit window"
            );
        }

        self.store
            .set_with_expiry(key, &record.encode()?, ttl_secs(self.config.window))
            .await?;
        Ok(record)
    }
}
