//! Offline replay of request traces through the token bucket limiter.
//!
//! A trace lists requests as `(client, offset in milliseconds)` pairs. Replaying
//! it against a fresh limiter anchored at a single instant makes the decisions
//! reproducible, which is handy for checking a capacity/interval choice
//! against recorded traffic.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::TokenBucketLimiter;

/// A recorded or generated sequence of requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    /// Limiter capacity to replay with
    pub capacity: u32,
    /// Limiter refill interval in milliseconds
    pub refill_interval_ms: u64,
    /// Requests in arrival order
    #[serde(default)]
    pub requests: Vec<TraceRequest>,
}

/// A single request in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    /// Client key
    pub client: String,
    /// Arrival time in milliseconds since the start of the trace
    pub at_ms: u64,
}

/// The limiter's decision for one traced request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Client key
    pub client: String,
    /// Arrival time in milliseconds since the start of the trace
    pub at_ms: u64,
    /// Whether the limiter let the request through
    pub allowed: bool,
}

impl Trace {
    /// Load a trace from a YAML or JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading trace");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents).map_err(|e| {
                TollgateError::InvalidTrace(format!("Failed to parse trace: {}", e))
            }),
            _ => Self::from_yaml(&contents),
        }
    }

    /// Parse a trace from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::InvalidTrace(format!("Failed to parse trace: {}", e)))
    }

    /// Generate a synthetic trace of `requests` arrivals spread uniformly over
    /// `span_ms` among `clients` clients.
    pub fn generate<R: Rng>(
        clients: usize,
        requests: usize,
        span_ms: u64,
        capacity: u32,
        refill_interval_ms: u64,
        rng: &mut R,
    ) -> Result<Self> {
        if clients == 0 {
            return Err(TollgateError::InvalidParameter(
                "at least one client is required".to_string(),
            ));
        }

        let mut requests: Vec<TraceRequest> = (0..requests)
            .map(|_| TraceRequest {
                client: format!("client-{}", rng.gen_range(0..clients)),
                at_ms: rng.gen_range(0..=span_ms),
            })
            .collect();
        requests.sort_by_key(|r| r.at_ms);

        Ok(Self {
            capacity,
            refill_interval_ms,
            requests,
        })
    }

    fn check_order(&self) -> Result<()> {
        for (i, pair) in self.requests.windows(2).enumerate() {
            if pair[1].at_ms < pair[0].at_ms {
                return Err(TollgateError::InvalidTrace(format!(
                    "request {} at {}ms arrives before request {} at {}ms",
                    i + 1,
                    pair[1].at_ms,
                    i,
                    pair[0].at_ms
                )));
            }
        }
        Ok(())
    }
}

/// Run every request of `trace` through a fresh limiter.
pub fn replay(trace: &Trace) -> Result<Vec<Outcome>> {
    trace.check_order()?;

    let limiter = TokenBucketLimiter::new(
        trace.capacity,
        Duration::from_millis(trace.refill_interval_ms),
    )?;
    let origin = Instant::now();

    Ok(trace
        .requests
        .iter()
        .map(|request| {
            let at = origin + Duration::from_millis(request.at_ms);
            Outcome {
                client: request.client.clone(),
                at_ms: request.at_ms,
                allowed: limiter.allow_at(&request.client, at),
            }
        })
        .collect())
}

/// Allowed and rejected counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    /// Requests the limiter let through
    pub allowed: u64,
    /// Requests the limiter turned away
    pub rejected: u64,
}

impl Counts {
    fn record(&mut self, allowed: bool) {
        if allowed {
            self.allowed += 1;
        } else {
            self.rejected += 1;
        }
    }
}

/// Aggregated replay results.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Counts across all clients
    pub total: Counts,
    /// Counts per client key, ordered by key
    pub per_client: BTreeMap<String, Counts>,
}

impl Summary {
    /// Tally a list of outcomes.
    pub fn from_outcomes(outcomes: &[Outcome]) -> Self {
        let mut summary = Summary::default();
        for outcome in outcomes {
            summary.total.record(outcome.allowed);
            summary
                .per_client
                .entry(outcome.client.clone())
                .or_default()
                .record(outcome.allowed);
        }
        summary
    }
}
