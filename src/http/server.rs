//! HTTP server wiring the named limiters onto their routes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::enforce_rate_limit;
use crate::error::Result;
use crate::ratelimit::{CounterStore, Limiters, RateLimitInfo};

/// HTTP server for the rate-limited API.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// The named limiters
    limiters: Limiters,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, limiters: Limiters) -> Self {
        Self { addr, limiters }
    }

    pub fn router(&self) -> Router {
        build_router(&self.limiters)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server stops accepting connections when `signal` resolves and
    /// returns once in-flight requests have drained. Closing the store is
    /// left to the caller.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;

        info!(
            addr = %self.addr,
            "Starting HTTP server with graceful shutdown"
        );

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            e.into()
        })
    }
}

/// Build the API router.
///
/// Every `/api` route counts against the general API limiter. Authentication,
/// conversation creation and telephony routes additionally count against
/// their own, stricter limiter.
pub fn build_router(limiters: &Limiters) -> Router {
    let auth = Router::new()
        .route("/api/auth/login", post(forward))
        .route("/api/auth/register", post(forward))
        .route("/api/auth/refresh", post(forward))
        .route_layer(middleware::from_fn_with_state(
            limiters.auth.clone(),
            enforce_rate_limit,
        ));

    let conversations = Router::new()
        .route("/api/conversations", post(forward))
        .route_layer(middleware::from_fn_with_state(
            limiters.conversation.clone(),
            enforce_rate_limit,
        ));

    let telephony = Router::new()
        .route("/api/sip/calls", post(forward))
        .route("/api/sip/calls/{id}/transfer", post(forward))
        .route_layer(middleware::from_fn_with_state(
            limiters.telephony.clone(),
            enforce_rate_limit,
        ));

    let general = Router::new()
        .route("/api/agents", get(forward).post(forward))
        .route("/api/agents/{id}", get(forward).put(forward).delete(forward))
        .route("/api/conversations/{id}", get(forward))
        .route("/api/analytics", get(forward));

    let api = auth
        .merge(conversations)
        .merge(telephony)
        .merge(general)
        .route_layer(middleware::from_fn_with_state(
            limiters.api.clone(),
            enforce_rate_limit,
        ));

    let status = Router::new()
        .route("/health", get(health))
        .with_state(limiters.store().clone());

    api.merge(status)
}

/// Stand-in for the downstream API handlers: echoes the quota metadata the
/// limiters attached to the request.
async fn forward(request: Request<Body>) -> Json<Value> {
    let quota = request.extensions().get::<RateLimitInfo>().copied();
    Json(json!({
        "status": "accepted",
        "path": request.uri().path(),
        "rateLimit": quota,
    }))
}

async fn health(State(store): State<Arc<dyn CounterStore>>) -> Json<Value> {
    let reachable = store.is_healthy().await;
    Json(json!({
        "status": "ok",
        "backend": store.backend_name(),
        "store": if reachable { "connected" } else { "unavailable" },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{AuthenticatedUser, X_RATELIMIT_LIMIT};
    use crate::ratelimit::{ManualClock, MemoryStore, PresetsConfig};
    use axum::{body::to_bytes, extract::ConnectInfo, http::StatusCode};
    use tower::util::ServiceExt;

    fn limiters() -> Limiters {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        Limiters::with_clock(&PresetsConfig::default(), store, clock)
    }

    fn request(method: &str, path: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method(method)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        let addr: SocketAddr = "1.2.3.4:5555".parse().unwrap();
        request.extensions_mut().insert(ConnectInfo(addr));
        request
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let server = HttpServer::new(addr, limiters());
        let _router = server.router();
    }

    #[tokio::test]
    async fn test_auth_routes_use_auth_limiter() {
        let app = build_router(&limiters());

        for i in 1..=5 {
            let response = app.clone().oneshot(request("POST", "/api/auth/login")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK, "attempt {}", i);
            assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "5");
        }

        let response = app.oneshot(request("POST", "/api/auth/register")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = json_body(response).await;
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retryAfter"], 900);
    }

    #[tokio::test]
    async fn test_general_routes_use_api_limiter() {
        let app = build_router(&limiters());

        let response = app.oneshot(request("GET", "/api/agents/42")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "100");

        let body = json_body(response).await;
        assert_eq!(body["rateLimit"]["limit"], 100);
        assert_eq!(body["rateLimit"]["current"], 1);
        assert_eq!(body["rateLimit"]["remaining"], 99);
    }

    #[tokio::test]
    async fn test_api_limiter_101st_request_throttled() {
        let app = build_router(&limiters());

        for _ in 0..100 {
            let response = app.clone().oneshot(request("GET", "/api/agents")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.oneshot(request("GET", "/api/agents")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn test_conversation_creation_limited_per_user() {
        let app = build_router(&limiters());

        for _ in 0..10 {
            let mut req = request("POST", "/api/conversations");
            req.extensions_mut().insert(AuthenticatedUser::new("alice"));
            assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
        }

        let mut req = request("POST", "/api/conversations");
        req.extensions_mut().insert(AuthenticatedUser::new("alice"));
        assert_eq!(
            app.clone().oneshot(req).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        let mut req = request("POST", "/api/conversations");
        req.extensions_mut().insert(AuthenticatedUser::new("bob"));
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_telephony_limiter_reported_over_api_limiter() {
        let app = build_router(&limiters());

        let response = app.oneshot(request("POST", "/api/sip/calls")).await.unwrap();
        assert_eq!(response.headers()[&X_RATELIMIT_LIMIT], "5");
    }

    #[tokio::test]
    async fn test_health_reports_store_state() {
        let limiters = limiters();
        let app = build_router(&limiters);

        let body = json_body(app.clone().oneshot(request("GET", "/health")).await.unwrap()).await;
        assert_eq!(body["store"], "connected");
        assert_eq!(body["backend"], "memory");

        limiters.shutdown().await.unwrap();
        let body = json_body(app.oneshot(request("GET", "/health")).await.unwrap()).await;
        assert_eq!(body["store"], "unavailable");
    }

    #[tokio::test]
    async fn test_closed_store_fails_open() {
        let limiters = limiters();
        limiters.shutdown().await.unwrap();
        let app = build_router(&limiters);

        for _ in 0..10 {
            let response = app.clone().oneshot(request("POST", "/api/auth/login")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(&X_RATELIMIT_LIMIT).is_none());
        }
    }
}
