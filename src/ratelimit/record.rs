//! Window record stored per quota key.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::store::StoreError;

/// The shared-state entity tracked for a quota key.
///
/// The canonical copy lives in the counter store; it is serialized as
/// `{"count":N,"resetTime":MS}` so that every instance sharing the store
/// reads the same shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowRecord {
    /// Requests observed in the current window
    pub count: u64,
    /// Window expiry, milliseconds since the Unix epoch
    pub reset_time: i64,
}

impl WindowRecord {
    /// Open a new window at `now_ms` with a count of one.
    pub fn fresh(now_ms: i64, window: Duration) -> Self {
        Self {
            count: 1,
            reset_time: now_ms.saturating_add(window_millis(window)),
        }
    }

    /// Whether the window has expired at `now_ms`.
    ///
    /// A record is still current at exactly `reset_time`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms > self.reset_time
    }

    /// Advance the record for one more request observed at `now_ms`.
    ///
    /// `None` and expired records are superseded by a fresh window;
    /// otherwise the count is bumped and `reset_time` is kept.
    pub fn advance(existing: Option<Self>, now_ms: i64, window: Duration) -> Self {
        match existing {
            Some(record) if !record.is_expired(now_ms) => Self {
                count: record.count.saturating_add(1),
                reset_time: record.reset_time,
            },
            _ => Self::fresh(now_ms, window),
        }
    }

    /// Requests left before throttling starts.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Whole seconds until the window resets, rounded up and never negative.
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let millis = self.reset_time.saturating_sub(now_ms).max(0) as u64;
        millis.div_ceil(1000)
    }

    /// The reset instant as a UTC timestamp.
    pub fn reset_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.reset_time)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Serialize the record for the store.
    pub fn encode(&self) -> Result<String, StoreError> {
        serde_json::to_string(self).map_err(StoreError::Malformed)
    }

    /// Parse a record previously written by [`WindowRecord::encode`].
    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        serde_json::from_str(raw).map_err(StoreError::Malformed)
    }
}

/// Store TTL for a window: the window length rounded up to whole seconds.
///
/// Never zero, since a zero expiry is rejected by the store.
pub fn ttl_secs(window: Duration) -> u64 {
    (window_millis(window) as u64).div_ceil(1000).max(1)
}

fn window_millis(window: Duration) -> i64 {
    i64::try_from(window.as_millis()).unwrap_or(i64::MAX)
}
