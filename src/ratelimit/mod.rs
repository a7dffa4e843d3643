//! Rate limiting logic and shared counter state.

mod clock;
mod key;
mod limiter;
mod memory;
mod presets;
mod record;
mod redis_store;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::{KeyGenerator, KeyRule, NamespacedKey, RequestContext, ANONYMOUS, DEFAULT_NAMESPACE};
pub use limiter::{
    Decision, LimitConfig, RateLimitInfo, RateLimiter, Throttled, DEFAULT_MESSAGE,
    RATE_LIMIT_EXCEEDED,
};
pub use memory::MemoryStore;
pub use presets::{LimiterPreset, Limiters, PresetsConfig};
pub use record::{ttl_secs, WindowRecord};
pub use redis_store::RedisStore;
pub use store::{CounterStore, StoreError, StoreResult};
