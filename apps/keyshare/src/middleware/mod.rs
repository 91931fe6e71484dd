//! Middleware for the keyshare server.
//!
//! Cross-cutting concerns that apply across multiple routes: internal token
//! authentication and per-client rate limiting.

pub mod auth;
pub mod rate_limit;

pub use auth::InternalAuth;
pub use rate_limit::{LimiterConfig, RateLimitConfig, RateLimiter, RateLimiters};
