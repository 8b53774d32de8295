//! Rate limiting using per-app token buckets.
//!
//! Each app has three independent budgets: client events, backend events
//! and read requests. Events published in-process are not limited.

mod limiter;
mod token_bucket;

pub use limiter::{EventRateLimiter, LimitKind, RateLimitResult, RateLimiterStats};
pub use token_bucket::TokenBucket;
