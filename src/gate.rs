//! Admission gate combining the rate limiter and the overload detector.

use std::sync::Arc;
use tracing::{debug, instrument};

use crate::overload::OverloadSignal;
use crate::ratelimit::TokenBucketLimiter;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// The request may proceed
    Admit,
    /// The client has used up its credits for the current interval
    RateLimited,
    /// The process is overloaded and sheds all incoming work
    Overloaded,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admit)
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Decision::Admit => "admit",
            Decision::RateLimited => "rate_limited",
            Decision::Overloaded => "overloaded",
        };
        f.write_str(s)
    }
}

/// Decides whether a request should be accepted before any work is done.
///
/// Either component is optional. The overload signal is checked first so
/// that shed requests do not spend client credits.
#[derive(Debug, Clone, Default)]
pub struct AdmissionGate {
    limiter: Option<Arc<TokenBucketLimiter>>,
    overload: Option<OverloadSignal>,
}

impl AdmissionGate {
    /// Create a gate that admits everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply per-client rate limiting.
    pub fn with_limiter(mut self, limiter: Arc<TokenBucketLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Shed all requests while the signal reports overload.
    pub fn with_overload_signal(mut self, signal: OverloadSignal) -> Self {
        self.overload = Some(signal);
        self
    }

    /// Decide on a request from `client_key`.
    #[instrument(level = "trace", skip(self))]
    pub fn check(&self, client_key: &str) -> Decision {
        if let Some(ref overload) = self.overload {
            if overload.is_overloaded() {
                debug!(client = client_key, "Request shed, process overloaded");
                return Decision::Overloaded;
            }
        }

        if let Some(ref limiter) = self.limiter {
            if !limiter.allow(client_key) {
                return Decision::RateLimited;
            }
        }

        Decision::Admit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overload::OverloadDetector;
    use std::time::Duration;
    use tokio::time;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_empty_gate_admits_everything() {
        let gate = AdmissionGate::new();
        for _ in 0..1000 {
            assert_eq!(gate.check("anyone"), Decision::Admit);
        }
    }

    #[test]
    fn test_gate_applies_rate_limit() {
        let limiter = Arc::new(TokenBucketLimiter::new(2, Duration::from_secs(60)).unwrap());
        let gate = AdmissionGate::new().with_limiter(Arc::clone(&limiter));

        assert_eq!(gate.check("c"), Decision::Admit);
        assert_eq!(gate.check("c"), Decision::Admit);
        assert_eq!(gate.check("c"), Decision::RateLimited);
        assert_eq!(gate.check("other"), Decision::Admit);
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overload_sheds_before_spending_credits() {
        let limiter = Arc::new(TokenBucketLimiter::new(1, Duration::from_secs(60)).unwrap());
        let detector = OverloadDetector::start(ms(100), ms(200), std::future::pending()).unwrap();
        let gate = AdmissionGate::new()
            .with_limiter(Arc::clone(&limiter))
            .with_overload_signal(detector.signal());

        time::advance(ms(300)).await;
        time::sleep(ms(1)).await;
        assert_eq!(gate.check("c"), Decision::Overloaded);
        assert_eq!(limiter.tracked_clients(), 0);

        // Once ticks are back on time the request reaches the limiter
        time::sleep(ms(100)).await;
        assert_eq!(gate.check("c"), Decision::Admit);
        assert_eq!(gate.check("c"), Decision::RateLimited);

        detector.stop().await;
    }

    #[test]
    fn test_decision_display() {
        assert!(Decision::Admit.is_admitted());
        assert!(!Decision::RateLimited.is_admitted());
        assert_eq!(Decision::Overloaded.to_string(), "overloaded");
    }
}
