//! Core dispatch engine: configuration, rate limiting, vendor calls, cache

pub mod backoff;
pub mod cache;
pub mod client;
pub mod config;
pub mod degradation;
pub mod dispatch;
pub mod engine;
pub mod errors;
pub mod models;
pub mod prompt;
pub mod rate_limiter;
