//! Named limiter presets and their configuration.
//!
//! Each protected surface of the API gets its own limiter: authentication
//! attempts, general API traffic, conversation creation and telephony
//! operations. Presets are plain configuration over [`RateLimiter`]; they can
//! be overridden from YAML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::clock::Clock;
use super::key::{KeyRule, NamespacedKey};
use super::limiter::{LimitConfig, RateLimiter};
use super::store::{CounterStore, StoreResult};
use crate::error::{QuotagateError, Result};

/// Configuration for one named limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterPreset {
    /// Tag prefixed to every key of this limiter
    pub namespace: String,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Requests allowed per window
    pub max_requests: u64,
    /// Text returned to throttled callers
    pub message: String,
    /// Which request inputs make up the key
    pub key: KeyRule,
}

impl LimiterPreset {
    /// Login and other credential endpoints: 5 attempts per 15 minutes per address.
    pub fn auth() -> Self {
        Self {
            namespace: "auth".to_string(),
            window_ms: 15 * 60 * 1000,
            max_requests: 5,
            message: "Too many authentication attempts, please try again later.".to_string(),
            key: KeyRule::Address,
        }
    }

    /// General API traffic: 100 requests per minute per identity and address.
    pub fn api() -> Self {
        Self {
            namespace: "api".to_string(),
            window_ms: 60 * 1000,
            max_requests: 100,
            message: "Too many requests, please try again later.".to_string(),
            key: KeyRule::IdentityAndAddress,
        }
    }

    /// Conversation creation: 10 per minute per identity.
    pub fn conversation() -> Self {
        Self {
            namespace: "conversation".to_string(),
            window_ms: 60 * 1000,
            max_requests: 10,
            message: "Too many conversations created, please slow down.".to_string(),
            key: KeyRule::IdentityOrAddress,
        }
    }

    /// Telephony (SIP) operations: 5 per minute per identity.
    pub fn telephony() -> Self {
        Self {
            namespace: "sip".to_string(),
            window_ms: 60 * 1000,
            max_requests: 5,
            message: "Too many telephony operations, please try again later.".to_string(),
            key: KeyRule::IdentityOrAddress,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Build a limiter for this preset on top of a shared store.
    pub fn build(&self, name: &str, store: Arc<dyn CounterStore>) -> RateLimiter {
        let config = LimitConfig {
            name: name.to_string(),
            window: self.window(),
            max_requests: self.max_requests,
            message: self.message.clone(),
        };
        RateLimiter::new(config, store)
            .with_key_generator(NamespacedKey::new(self.namespace.clone(), self.key))
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            return Err(QuotagateError::Config(format!(
                "limiter '{}' must have a non-zero window",
                name
            )));
        }
        if self.namespace.is_empty() {
            return Err(QuotagateError::Config(format!(
                "limiter '{}' must have a namespace",
                name
            )));
        }
        Ok(())
    }
}

/// Configuration for every named limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresetsConfig {
    #[serde(default = "LimiterPreset::auth")]
    pub auth: LimiterPreset,
    #[serde(default = "LimiterPreset::api")]
    pub api: LimiterPreset,
    #[serde(default = "LimiterPreset::conversation")]
    pub conversation: LimiterPreset,
    #[serde(default = "LimiterPreset::telephony")]
    pub telephony: LimiterPreset,
}

impl Default for PresetsConfig {
    fn default() -> Self {
        Self {
            auth: LimiterPreset::auth(),
            api: LimiterPreset::api(),
            conversation: LimiterPreset::conversation(),
            telephony: LimiterPreset::telephony(),
        }
    }
}

impl PresetsConfig {
    /// Load presets from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter presets");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load presets from a YAML string. Omitted limiters keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PresetsConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotagateError::Config(format!("Failed to parse limiter presets: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.auth.validate("auth")?;
        self.api.validate("api")?;
        self.conversation.validate("conversation")?;
        self.telephony.validate("telephony")?;

        let mut namespaces = vec![
            &self.auth.namespace,
            &self.api.namespace,
            &self.conversation.namespace,
            &self.telephony.namespace,
        ];
        namespaces.sort();
        namespaces.dedup();
        if namespaces.len() != 4 {
            return Err(QuotagateError::Config(
                "limiter namespaces must be distinct".to_string(),
            ));
        }
        Ok(())
    }
}

/// The named limiters, all sharing one store handle.
#[derive(Clone)]
pub struct Limiters {
    pub auth: Arc<RateLimiter>,
    pub api: Arc<RateLimiter>,
    pub conversation: Arc<RateLimiter>,
    pub telephony: Arc<RateLimiter>,
    store: Arc<dyn CounterStore>,
}

impl Limiters {
    pub fn new(presets: &PresetsConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            auth: Arc::new(presets.auth.build("auth", store.clone())),
            api: Arc::new(presets.api.build("api", store.clone())),
            conversation: Arc::new(presets.conversation.build("conversation", store.clone())),
            telephony: Arc::new(presets.telephony.build("telephony", store.clone())),
            store,
        }
    }

    /// Like [`Limiters::new`], with every limiter reading time from `clock`.
    pub fn with_clock(
        presets: &PresetsConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let build = |preset: &LimiterPreset, name: &str| {
            Arc::new(preset.build(name, store.clone()).with_clock(clock.clone()))
        };
        Self {
            auth: build(&presets.auth, "auth"),
            api: build(&presets.api, "api"),
            conversation: build(&presets.conversation, "conversation"),
            telephony: build(&presets.telephony, "telephony"),
            store: store.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Release the shared store connection.
    pub async fn shutdown(&self) -> StoreResult<()> {
        info!(backend = self.store.backend_name(), "Closing rate limit store");
        self.store.close().await
    }
}
