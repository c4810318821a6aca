//! Overload detection by timer drift.
//!
//! The detector never looks at request latency. A background task ticks on a
//! fixed period and measures how long it actually took between ticks; when
//! the runtime is saturated the ticks arrive late, and a gap larger than the
//! configured threshold marks the process as overloaded until the next
//! on-time tick.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::periodic::PeriodicTask;
use crate::config::OverloadConfig;
use crate::error::{Result, TollgateError};

/// Result of a single drift sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    /// Time since the previous sample
    pub elapsed: Duration,
    /// Whether `elapsed` exceeded the threshold
    pub overloaded: bool,
}

/// Measures the gap between consecutive ticks.
#[derive(Debug, Clone)]
pub struct DriftSampler {
    threshold: Duration,
    window_start: Instant,
}

impl DriftSampler {
    /// Create a sampler whose first window opens at `start`.
    pub fn new(threshold: Duration, start: Instant) -> Self {
        Self {
            threshold,
            window_start: start,
        }
    }

    /// Close the current window at `now` and open the next one.
    pub fn sample(&mut self, now: Instant) -> Sample {
        let elapsed = now.saturating_duration_since(self.window_start);
        self.window_start = now;
        Sample {
            elapsed,
            overloaded: elapsed > self.threshold,
        }
    }

    /// The start of the current window.
    pub fn window_start(&self) -> Instant {
        self.window_start
    }
}

/// Read-only view of the overload flag.
///
/// Cloning is cheap; hand one to every request handler that needs to shed load.
#[derive(Debug, Clone)]
pub struct OverloadSignal {
    flag: Arc<AtomicBool>,
}

impl OverloadSignal {
    /// Whether the last sample found the process overloaded.
    ///
    /// This is a single atomic load and never blocks.
    pub fn is_overloaded(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// System-wide overload detector.
///
/// Sampling starts as soon as the detector is constructed and runs until
/// [`OverloadDetector::stop`] is called, the shutdown future passed at
/// construction resolves, or the detector is dropped. The flag keeps its
/// last value once sampling ends.
#[derive(Debug)]
pub struct OverloadDetector {
    signal: OverloadSignal,
    task: PeriodicTask,
    overload_threshold: Duration,
}

impl OverloadDetector {
    /// Start a detector sampling every `check_interval`.
    ///
    /// A gap between samples longer than `overload_threshold` raises the
    /// flag. The threshold must exceed the interval, otherwise ordinary
    /// scheduling jitter would read as overload. Sampling stops for good
    /// once `shutdown` resolves.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S>(
        check_interval: Duration,
        overload_threshold: Duration,
        shutdown: S,
    ) -> Result<Self>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        if check_interval.is_zero() {
            return Err(TollgateError::InvalidParameter(
                "check interval must be positive".to_string(),
            ));
        }
        if overload_threshold <= check_interval {
            return Err(TollgateError::InvalidParameter(format!(
                "overload threshold ({:?}) must exceed check interval ({:?})",
                overload_threshold, check_interval
            )));
        }

        let flag = Arc::new(AtomicBool::new(false));
        let writer = Arc::clone(&flag);
        let mut sampler = DriftSampler::new(overload_threshold, Instant::now());

        let task = PeriodicTask::spawn("overload-detector", check_interval, shutdown, move |now| {
            let sample = sampler.sample(now);
            // The sampling task is the only writer, so its own last store is current.
            let was_overloaded = writer.load(Ordering::Relaxed);
            writer.store(sample.overloaded, Ordering::Release);

            debug!(
                elapsed = ?sample.elapsed,
                overloaded = sample.overloaded,
                "Drift sample taken"
            );

            match (was_overloaded, sample.overloaded) {
                (false, true) => warn!(
                    elapsed = ?sample.elapsed,
                    "Timer drift exceeded threshold, shedding load"
                ),
                (true, false) => info!(
                    elapsed = ?sample.elapsed,
                    "Timer drift back within threshold"
                ),
                _ => {}
            }
        })?;

        info!(
            check_interval = ?check_interval,
            overload_threshold = ?overload_threshold,
            "Overload detector started"
        );

        Ok(Self {
            signal: OverloadSignal { flag },
            task,
            overload_threshold,
        })
    }

    /// Start a detector from configuration.
    pub fn from_config<S>(config: &OverloadConfig, shutdown: S) -> Result<Self>
    where
        S: Future<Output = ()> + Send + 'static,
    {
        Self::start(config.check_interval(), config.overload_threshold(), shutdown)
    }

    /// Whether the last sample found the process overloaded.
    ///
    /// Starts out `false` and stays at its last value after sampling stops.
    pub fn is_overloaded(&self) -> bool {
        self.signal.is_overloaded()
    }

    /// A clonable read-only handle to the flag.
    pub fn signal(&self) -> OverloadSignal {
        self.signal.clone()
    }

    /// Whether the sampling task is still running.
    pub fn is_running(&self) -> bool {
        self.task.is_running()
    }

    /// The sampling period.
    pub fn check_interval(&self) -> Duration {
        self.task.period()
    }

    /// The gap between samples beyond which the process counts as overloaded.
    pub fn overload_threshold(&self) -> Duration {
        self.overload_threshold
    }

    /// Stop sampling and wait for the background task to exit.
    ///
    /// Calls after the first are no-ops.
    pub async fn stop(&self) {
        if self.task.is_running() {
            info!("Stopping overload detector");
        }
        self.task.stop().await;
    }
}
