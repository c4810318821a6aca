//! Core token bucket limiter implementation.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::bucket::Bucket;
use crate::config::LimiterConfig;
use crate::error::{Result, TollgateError};

/// Per-client token bucket rate limiter.
///
/// Buckets live in a sharded map, so requests for keys in different shards
/// never contend on the same lock. Each key's accounting step runs under its
/// shard's exclusive lock. Buckets are created on first sight and are never
/// evicted.
///
/// This struct is thread-safe and can be shared across multiple tasks.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    /// Maximum credits per refill interval
    capacity: u32,
    /// Time after which a full batch of credits becomes available
    refill_interval: Duration,
    /// Buckets indexed by client key
    buckets: DashMap<String, Bucket>,
}

impl TokenBucketLimiter {
    /// Create a new limiter allowing `capacity` requests per `refill_interval`.
    pub fn new(capacity: u32, refill_interval: Duration) -> Result<Self> {
        validate(capacity, refill_interval)?;
        Ok(Self {
            capacity,
            refill_interval,
            buckets: DashMap::new(),
        })
    }

    /// Create a limiter whose bucket map is split into `shards` partitions.
    ///
    /// `shards` must be a power of two greater than one.
    pub fn with_shards(capacity: u32, refill_interval: Duration, shards: usize) -> Result<Self> {
        validate(capacity, refill_interval)?;
        if shards < 2 || !shards.is_power_of_two() {
            return Err(TollgateError::InvalidParameter(format!(
                "shard count must be a power of two greater than 1, got {}",
                shards
            )));
        }
        Ok(Self {
            capacity,
            refill_interval,
            buckets: DashMap::with_shard_amount(shards),
        })
    }

    /// Create a limiter from configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        Self::with_shards(config.capacity, config.refill_interval(), config.shards)
    }

    /// Decide whether the current request for `client_key` may proceed.
    pub fn allow(&self, client_key: &str) -> bool {
        self.allow_at(client_key, Instant::now())
    }

    /// Decide whether a request for `client_key` arriving at `now` may proceed.
    ///
    /// Given the same sequence of `(client_key, now)` pairs the decisions are
    /// always the same.
    pub fn allow_at(&self, client_key: &str, now: Instant) -> bool {
        if let Some(mut bucket) = self.buckets.get_mut(client_key) {
            return self.consume(client_key, &mut bucket, now);
        }

        // Another caller may have created the bucket since the lookup above.
        match self.buckets.entry(client_key.to_owned()) {
            Entry::Occupied(mut entry) => self.consume(client_key, entry.get_mut(), now),
            Entry::Vacant(entry) => {
                debug!(
                    client = client_key,
                    capacity = self.capacity,
                    refill_interval = ?self.refill_interval,
                    "Creating new bucket"
                );
                entry.insert(Bucket::new(self.capacity, now));
                true
            }
        }
    }

    fn consume(&self, client_key: &str, bucket: &mut Bucket, now: Instant) -> bool {
        let allowed = bucket.try_consume(self.capacity, self.refill_interval, now);

        if allowed {
            trace!(
                client = client_key,
                remaining = bucket.remaining(),
                "Request allowed"
            );
        } else {
            debug!(client = client_key, "Rate limit exceeded");
        }

        allowed
    }

    /// Maximum credits per refill interval.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The refill interval.
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Credits left for `client_key` after its last allowed request.
    ///
    /// Returns `None` if the key has never been seen.
    pub fn remaining(&self, client_key: &str) -> Option<i64> {
        self.buckets.get(client_key).map(|bucket| bucket.remaining())
    }

    /// Get the number of tracked client keys.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    /// Clear all buckets.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

fn validate(capacity: u32, refill_interval: Duration) -> Result<()> {
    if capacity == 0 {
        return Err(TollgateError::InvalidParameter(
            "capacity must be positive".to_string(),
        ));
    }
    if refill_interval.is_zero() {
        return Err(TollgateError::InvalidParameter(
            "refill interval must be positive".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_err, assert_ok};

    const SECOND: Duration = Duration::from_secs(1);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = assert_ok!(TokenBucketLimiter::new(10, SECOND));
        assert_eq!(limiter.capacity(), 10);
        assert_eq!(limiter.refill_interval(), SECOND);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        assert_err!(TokenBucketLimiter::new(0, SECOND));
        assert_err!(TokenBucketLimiter::new(1, Duration::ZERO));
        assert_err!(TokenBucketLimiter::with_shards(1, SECOND, 0));
        assert_err!(TokenBucketLimiter::with_shards(1, SECOND, 1));
        assert_err!(TokenBucketLimiter::with_shards(1, SECOND, 12));
        assert_ok!(TokenBucketLimiter::with_shards(1, SECOND, 16));
    }

    #[test]
    fn test_first_request_always_allowed() {
        let limiter = TokenBucketLimiter::new(1, SECOND).unwrap();
        let t0 = Instant::now();

        for i in 0..100 {
            assert!(limiter.allow_at(&format!("client-{}", i), t0));
        }
        assert_eq!(limiter.tracked_clients(), 100);
    }

    #[test]
    fn test_capacity_bound_within_interval() {
        let limiter = TokenBucketLimiter::new(5, SECOND).unwrap();
        let t0 = Instant::now();

        for i in 0..5 {
            assert!(limiter.allow_at("c", t0 + ms(i * 100)), "request {} should pass", i);
        }

        // 6th request within the same window is rejected
        assert!(!limiter.allow_at("c", t0 + ms(900)));
        assert_eq!(limiter.remaining("c"), Some(0));
    }

    #[test]
    fn test_reject_leaves_state_untouched() {
        let limiter = TokenBucketLimiter::new(1, SECOND).unwrap();
        let t0 = Instant::now();

        assert!(limiter.allow_at("c", t0));
        assert!(!limiter.allow_at("c", t0 + ms(100)));
        assert!(!limiter.allow_at("c", t0 + ms(200)));
        assert!(limiter.allow_at("c", t0 + ms(1100)));
    }

    #[test]
    fn test_saturation_discards_excess_credits() {
        let limiter = TokenBucketLimiter::new(3, SECOND).unwrap();
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(limiter.allow_at("c", t0));
        }
        assert!(!limiter.allow_at("c", t0));

        // Idle for 10 intervals
        let later = t0 + ms(10_500);
        assert!(limiter.allow_at("c", later));
        assert_eq!(limiter.remaining("c"), Some(2));

        assert!(limiter.allow_at("c", later));
        assert!(limiter.allow_at("c", later));
        assert!(!limiter.allow_at("c", later));
    }

    #[test]
    fn test_single_interval_refills_full_batch() {
        let limiter = TokenBucketLimiter::new(4, SECOND).unwrap();
        let t0 = Instant::now();

        for _ in 0..4 {
            assert!(limiter.allow_at("c", t0));
        }

        let next = t0 + SECOND;
        for _ in 0..4 {
            assert!(limiter.allow_at("c", next));
        }
        assert!(!limiter.allow_at("c", next));
    }

    #[test]
    fn test_decisions_are_deterministic() {
        let t0 = Instant::now();
        let sequence: Vec<(&str, Duration)> = vec![
            ("a", ms(0)),
            ("b", ms(10)),
            ("a", ms(20)),
            ("a", ms(30)),
            ("b", ms(500)),
            ("a", ms(999)),
            ("a", ms(1000)),
            ("a", ms(1001)),
            ("b", ms(5000)),
            ("a", ms(2500)),
        ];

        let run = || {
            let limiter = TokenBucketLimiter::new(2, SECOND).unwrap();
            sequence
                .iter()
                .map(|(key, offset)| limiter.allow_at(key, t0 + *offset))
                .collect::<Vec<_>>()
        };

        let expected = vec![true, true, true, false, true, false, true, true, true, true];
        assert_eq!(run(), expected);
        assert_eq!(run(), run());
    }

    #[test]
    fn test_different_clients_have_separate_buckets() {
        let limiter = TokenBucketLimiter::new(1, SECOND).unwrap();
        let t0 = Instant::now();

        assert!(limiter.allow_at("a", t0));
        assert!(!limiter.allow_at("a", t0));
        assert!(limiter.allow_at("b", t0));
        assert_eq!(limiter.remaining("a"), Some(0));
        assert_eq!(limiter.remaining("unknown"), None);
    }

    #[test]
    fn test_concurrent_callers_respect_capacity() {
        let limiter = Arc::new(TokenBucketLimiter::with_shards(50, SECOND, 8).unwrap());
        let t0 = Instant::now();

        let allowed: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    scope.spawn(move || {
                        (0..100)
                            .filter(|_| limiter.allow_at("shared", t0))
                            .count()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });

        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_from_config() {
        let config = LimiterConfig {
            capacity: 7,
            refill_interval_ms: 250,
            shards: 4,
        };
        let limiter = TokenBucketLimiter::from_config(&config).unwrap();
        assert_eq!(limiter.capacity(), 7);
        assert_eq!(limiter.refill_interval(), ms(250));
    }

    #[test]
    fn test_clear_buckets() {
        let limiter = TokenBucketLimiter::new(1, SECOND).unwrap();
        limiter.allow("c");
        assert_eq!(limiter.tracked_clients(), 1);

        limiter.clear();
        assert_eq!(limiter.tracked_clients(), 0);
        assert!(limiter.allow("c"));
    }
}
