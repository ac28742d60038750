//! HTTP middleware.
//!
//! - Request logging with latency tracking
//! - Fixed-window rate limiting per IP address
//! - Bearer-token guard for admin routes

pub mod admin;
pub mod logging;
pub mod rate_limit;

pub use admin::{admin_auth, AdminToken};
pub use logging::request_logging;
pub use rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimiter};
