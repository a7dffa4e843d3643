//! Middleware applying a rate limiter to axum routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::warn;

use crate::ratelimit::{
    Decision, RateLimitInfo, RateLimiter, RequestContext, Throttled, RATE_LIMIT_EXCEEDED,
};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Identity resolved by the authentication layer.
///
/// Authentication middleware inserts this into the request extensions; the
/// rate limiter only reads it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
}

impl AuthenticatedUser {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Body returned with a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceededBody {
    pub error: String,
    pub code: &'static str,
    pub retry_after: u64,
}

/// Middleware function that counts the request against a limiter.
///
/// Apply it with `route_layer` so the matched route template is available
/// for key derivation:
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/api/auth/login", post(login))
///     .route_layer(middleware::from_fn_with_state(limiter, enforce_rate_limit));
/// ```
///
/// ## Behavior
///
/// - Within quota: the [`RateLimitInfo`] is inserted into the request
///   extensions, the request is forwarded and the `X-RateLimit-*` headers
///   are added to the response
/// - Over quota: 429 with a JSON body, the handler is not called
/// - Store unavailable: the request is forwarded untouched
pub async fn enforce_rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let ctx = request_context(&request);

    match limiter.check(&ctx).await {
        Decision::Allow(info) => {
            request.extensions_mut().insert(info);
            let mut response = next.run(request).await;
            apply_headers(response.headers_mut(), &info);
            response
        }
        Decision::Throttle(throttled) => {
            warn!(
                limiter = %limiter.name(),
                path = %ctx.path,
                current = throttled.info.current,
                limit = throttled.info.limit,
                retry_after = throttled.retry_after,
                "Request rejected: rate limit exceeded"
            );
            throttled.into_response()
        }
        Decision::FailOpen => next.run(request).await,
    }
}

/// Collect what key derivation needs from an axum request.
pub fn request_context(request: &Request<Body>) -> RequestContext {
    let extensions = request.extensions();
    RequestContext {
        remote_addr: extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip()),
        route: extensions
            .get::<MatchedPath>()
            .map(|path| path.as_str().to_string()),
        path: request.uri().path().to_string(),
        user_id: extensions
            .get::<AuthenticatedUser>()
            .map(|user| user.id.clone()),
    }
}

/// Add the quota headers unless an inner limiter already set them.
///
/// Limiters nest, so the innermost (most specific) limiter's quota is the
/// one reported.
pub fn apply_headers(headers: &mut HeaderMap, info: &RateLimitInfo) {
    headers
        .entry(X_RATELIMIT_LIMIT)
        .or_insert_with(|| HeaderValue::from(info.limit));
    headers
        .entry(X_RATELIMIT_REMAINING)
        .or_insert_with(|| HeaderValue::from(info.remaining));
    if let Ok(reset) = HeaderValue::from_str(&info.reset_iso8601()) {
        headers.entry(X_RATELIMIT_RESET).or_insert(reset);
    }
}

impl IntoResponse for Throttled {
    fn into_response(self) -> Response {
        let body = RateLimitExceededBody {
            error: self.message,
            code: RATE_LIMIT_EXCEEDED,
            retry_after: self.retry_after,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        apply_headers(response.headers_mut(), &self.info);
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{
        CounterStore, KeyRule, LimitConfig, ManualClock, MemoryStore, NamespacedKey,
    };
    use axum::{body::to_bytes, middleware, routing::get, Router};
    use std::time::Duration;
    use tower::util::ServiceExt;

    const START: i64 = 1_700_000_000_000;

    async fn handler(request: Request<Body>) -> String {
        match request.extensions().get::<RateLimitInfo>() {
            Some(info) => format!("current={}", info.current),
            None => "unlimited".to_string(),
        }
    }

    fn limiter(max: u64, rule: KeyRule) -> (Arc<MemoryStore>, Arc<RateLimiter>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let config = LimitConfig {
            name: "test".to_string(),
            window: Duration::from_secs(60),
            max_requests: max,
            message: "Too many requests".to_string(),
        };
        let limiter = RateLimiter::new(config, store.clone())
            .with_key_generator(NamespacedKey::new("test", rule))
            .with_clock(clock);
        (store, Arc::new(limiter))
    }

    fn app(limiter: Arc<RateLimiter>) -> Router {
        Router::new()
            .route("/api/agents/{id}", get(handler))
            .route_layer(middleware::from_fn_with_state(limiter, enforce_rate_limit))
    }

    fn request(path: &str, addr: &str) -> Request<Body> {
        let mut request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let addr: SocketAddr = format!("{}:40000", addr).parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    async fn body_string(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_allowed_request_gets_headers_and_info() {
        let (_, limiter) = limiter(10, KeyRule::RouteAndAddress);
        let app = app(limiter);

        let response = app.oneshot(request("/api/agents/1", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[&X_RATELIMIT_LIMIT], "10");
        assert_eq!(headers[&X_RATELIMIT_REMAINING], "9");
        assert_eq!(headers[&X_RATELIMIT_RESET], "2023-11-14T22:14:20.000Z");
        assert_eq!(body_string(response).await, "current=1");
    }

    #[tokio::test]
    async fn test_throttled_request_gets_429_body() {
        let (_, limiter) = limiter(1, KeyRule::Address);
        let app = app(limiter);

        app.clone().oneshot(request("/api/agents/1", "1.2.3.4")).await.unwrap();
        let response = app.oneshot(request("/api/agents/1", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[&X_RATELIMIT_REMAINING], "0");

        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retryAfter"], 60);
    }

    #[tokio::test]
    async fn test_route_template_scopes_key() {
        let (store, limiter) = limiter(10, KeyRule::RouteAndAddress);
        let app = app(limiter);

        app.clone().oneshot(request("/api/agents/1", "1.2.3.4")).await.unwrap();
        let response = app.oneshot(request("/api/agents/2", "1.2.3.4")).await.unwrap();

        assert_eq!(body_string(response).await, "current=2");
        assert!(store.get("test:1.2.3.4:/api/agents/{id}").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_authenticated_identity_scopes_key() {
        let (_, limiter) = limiter(1, KeyRule::IdentityOrAddress);
        let app = app(limiter);

        let mut first = request("/api/agents/1", "1.2.3.4");
        first.extensions_mut().insert(AuthenticatedUser::new("alice"));
        app.clone().oneshot(first).await.unwrap();

        let mut second = request("/api/agents/1", "1.2.3.4");
        second.extensions_mut().insert(AuthenticatedUser::new("bob"));
        let response = app.oneshot(second).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_store_failure_forwards_without_headers() {
        let (store, limiter) = limiter(0, KeyRule::Address);
        store.close().await.unwrap();
        let app = app(limiter);

        let response = app.oneshot(request("/api/agents/1", "1.2.3.4")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        assert!(response.headers().get(&X_RATELIMIT_REMAINING).is_none());
        assert!(response.headers().get(&X_RATELIMIT_RESET).is_none());
        assert_eq!(body_string(response).await, "unlimited");
    }

    #[tokio::test]
    async fn test_missing_connect_info_uses_sentinel() {
        let (store, limiter) = limiter(10, KeyRule::Address);
        let app = app(limiter);

        let request = Request::builder().uri("/api/agents/1").body(Body::empty()).unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.get("test:anonymous").await.unwrap().is_some());
    }

    #[test]
    fn test_request_context_extraction() {
        let mut request = request("/api/agents/7", "10.0.0.1");
        request.extensions_mut().insert(AuthenticatedUser::new("carol"));

        let ctx = request_context(&request);
        assert_eq!(ctx.remote_addr, Some("10.0.0.1".parse().unwrap()));
        assert_eq!(ctx.path, "/api/agents/7");
        assert_eq!(ctx.route, None);
        assert_eq!(ctx.user_id.as_deref(), Some("carol"));
    }
}
