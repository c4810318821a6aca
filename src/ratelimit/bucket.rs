//! Per-client credit bucket with discrete batch refill.

use std::time::{Duration, Instant};

/// Credit state for a single client key.
///
/// Credits are refilled in whole batches of `capacity` at every elapsed
/// refill interval. Outside of an accounting step `remaining` always lies in
/// `[0, capacity - 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Credits left after the last allowed request
    remaining: i64,
    /// Baseline from which elapsed refill intervals are counted
    last_refill: Instant,
}

impl Bucket {
    /// Create the bucket for a client's first request, which consumes one credit.
    pub fn new(capacity: u32, now: Instant) -> Self {
        Self {
            remaining: i64::from(capacity) - 1,
            last_refill: now,
        }
    }

    /// Credits left after the last allowed request.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Time from which the next refill is measured.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Try to consume one credit at `now`.
    ///
    /// Returns `false` and leaves the bucket untouched when no credit is
    /// available, so rejected requests never move the refill baseline.
    pub fn try_consume(&mut self, capacity: u32, refill_interval: Duration, now: Instant) -> bool {
        // A clock reading older than the baseline counts as no time elapsed.
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / refill_interval.as_nanos().max(1);

        let capacity = i64::from(capacity);
        let added = i64::try_from(intervals)
            .unwrap_or(i64::MAX)
            .saturating_mul(capacity);
        let available = self.remaining.saturating_add(added);

        if available < 1 {
            return false;
        }

        if available > capacity {
            // Idle for more than one batch: discard the excess and the
            // leftover fraction of the current interval.
            self.remaining = capacity - 1;
            self.last_refill = now;
        } else {
            // Advance by whole intervals only, keeping the partial interval.
            let whole = u32::try_from(intervals).unwrap_or(u32::MAX);
            self.remaining = available - 1;
            self.last_refill += refill_interval.saturating_mul(whole);
        }

        true
    }
}
