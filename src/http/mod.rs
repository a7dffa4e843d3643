//! HTTP surface: rate limiting middleware and the API server.

mod middleware;
mod server;

pub use middleware::{
    apply_headers, enforce_rate_limit, request_context, AuthenticatedUser, RateLimitExceededBody,
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET,
};
pub use server::{build_router, HttpServer};
