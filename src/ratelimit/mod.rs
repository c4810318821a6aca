//! Per-client token bucket rate limiting.

mod bucket;
mod limiter;

pub use bucket::Bucket;
pub use limiter::TokenBucketLimiter;
