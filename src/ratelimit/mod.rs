//! Per-connection inbound rate limiting using a fixed-window counter.
//!
//! Rejected messages are dropped and reported to the sender; the connection
//! stays open.

mod config;
mod limiter;

pub use config::RateLimitConfig;
pub use limiter::{RateLimitResult, RateLimiter, RateLimiterStats};
