//! Quotagate - Distributed Rate Limiting Middleware
//!
//! This crate implements fixed-window rate limiting for an HTTP API that
//! runs as several instances. Counters live in a shared Redis store so every
//! instance enforces the same quota, and the limiter fails open when the
//! store cannot be reached.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
