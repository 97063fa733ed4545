//! Request pacing and retry policy.
//!
//! Workers share per-endpoint-class [`RateLimiter`]s; failures go through
//! [`ExponentialBackoff`] under the classification rules in [`retry`].

mod limiter;
mod retry;

pub use limiter::{EndpointLimiters, LimiterSettings, RateLimiter};
pub use retry::{classify, should_retry, ErrorSeverity, ExponentialBackoff, RetryConfig};
