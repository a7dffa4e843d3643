//! Quota key derivation from request context.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Placeholder used when a request is missing an input a key rule needs.
pub const ANONYMOUS: &str = "anonymous";

/// Namespace used by [`KeyRule::RouteAndAddress`] when none is configured.
pub const DEFAULT_NAMESPACE: &str = "rate_limit";

/// The parts of an inbound request that key derivation may read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// The caller's network address
    pub remote_addr: Option<IpAddr>,
    /// The matched route template, e.g. `/api/agents/{id}`
    pub route: Option<String>,
    /// The raw request path
    pub path: String,
    /// Identity resolved by the authentication layer
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_remote_addr(mut self, addr: IpAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    fn address(&self) -> String {
        self.remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| ANONYMOUS.to_string())
    }

    fn identity(&self) -> Option<&str> {
        self.user_id.as_deref().filter(|id| !id.is_empty())
    }

    fn route_or_path(&self) -> &str {
        match self.route.as_deref() {
            Some(route) if !route.is_empty() => route,
            _ if !self.path.is_empty() => &self.path,
            _ => ANONYMOUS,
        }
    }
}

/// Derives the quota key for a request.
///
/// Implementations must be deterministic and must not fail; missing inputs
/// are replaced by [`ANONYMOUS`]. Any `Fn(&RequestContext) -> String` is a
/// key generator.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self, ctx: &RequestContext) -> String;
}

impl<F> KeyGenerator for F
where
    F: Fn(&RequestContext) -> String + Send + Sync,
{
    fn generate(&self, ctx: &RequestContext) -> String {
        self(ctx)
    }
}

/// Which request inputs make up a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyRule {
    /// `{namespace}:{address}:{route}`, the route falling back to the raw path
    RouteAndAddress,
    /// `{namespace}:{address}`
    Address,
    /// `{namespace}:{identity or anonymous}:{address}`
    IdentityAndAddress,
    /// `{namespace}:{identity}`, or `{namespace}:{address}` when unauthenticated
    IdentityOrAddress,
}

impl fmt::Display for KeyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyRule::RouteAndAddress => "route_and_address",
            KeyRule::Address => "address",
            KeyRule::IdentityAndAddress => "identity_and_address",
            KeyRule::IdentityOrAddress => "identity_or_address",
        };
        f.write_str(name)
    }
}

/// A [`KeyRule`] applied under a namespace tag.
///
/// Distinct limiters use distinct namespaces so their keys never collide in
/// the shared store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespacedKey {
    namespace: String,
    rule: KeyRule,
}

impl NamespacedKey {
    pub fn new(namespace: impl Into<String>, rule: KeyRule) -> Self {
        Self {
            namespace: namespace.into(),
            rule,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn rule(&self) -> KeyRule {
        self.rule
    }
}

impl Default for NamespacedKey {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE, KeyRule::RouteAndAddress)
    }
}

impl KeyGenerator for NamespacedKey {
    fn generate(&self, ctx: &RequestContext) -> String {
        let ns = &self.namespace;
        match self.rule {
            KeyRule::RouteAndAddress => {
                format!("{}:{}:{}", ns, ctx.address(), ctx.route_or_path())
            }
            KeyRule::Address => format!("{}:{}", ns, ctx.address()),
            KeyRule::IdentityAndAddress => format!(
                "{}:{}:{}",
                ns,
                ctx.identity().unwrap_or(ANONYMOUS),
                ctx.address()
            ),
            KeyRule::IdentityOrAddress => match ctx.identity() {
                Some(id) => format!("{}:{}", ns, id),
                None => format!("{}:{}", ns, ctx.address()),
            },
        }
    }
}
