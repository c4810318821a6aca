//! Cancellable fixed-period background task.

use std::future::Future;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::{Result, TollgateError};

/// Runs a callback on a fixed period until it is stopped.
///
/// The task exits when [`PeriodicTask::stop`] is called, when the external
/// shutdown future resolves, or when the `PeriodicTask` is dropped. The
/// callback receives the time at which the tick was actually observed,
/// which lags the nominal schedule when the runtime is busy.
pub struct PeriodicTask {
    name: &'static str,
    period: Duration,
    running: Mutex<Option<Running>>,
}

struct Running {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `callback` on the current Tokio runtime.
    ///
    /// The first tick fires one full `period` after this call. A tick that
    /// fires late pushes the following deadline back instead of bursting to
    /// catch up.
    pub fn spawn<F, S>(
        name: &'static str,
        period: Duration,
        shutdown: S,
        mut callback: F,
    ) -> Result<Self>
    where
        F: FnMut(Instant) + Send + 'static,
        S: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            return Err(TollgateError::InvalidParameter(format!(
                "{} period must be positive",
                name
            )));
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TollgateError::Runtime(format!("cannot start {}: {}", name, e)))?;

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let mut shutdown = shutdown.boxed();
        let start = Instant::now() + period;

        let handle = runtime.spawn(async move {
            let mut ticker = time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!(task = name, period = ?period, "Periodic task started");

            loop {
                tokio::select! {
                    biased;
                    // Also fires when the owning PeriodicTask is dropped.
                    _ = &mut stop_rx => break,
                    _ = &mut shutdown => break,
                    _ = ticker.tick() => callback(Instant::now()),
                }
            }

            debug!(task = name, "Periodic task stopped");
        });

        Ok(Self {
            name,
            period,
            running: Mutex::new(Some(Running { stop_tx, handle })),
        })
    }

    /// The tick period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Whether the background task is still looping.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Stop the task and wait for it to exit.
    ///
    /// When this returns the timer has been released and the callback will
    /// not run again. Calls after the first are no-ops.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(Running { stop_tx, handle }) = running else {
            return;
        };

        // The task may already have exited through the shutdown future.
        let _ = stop_tx.send(());

        if let Err(e) = handle.await {
            warn!(task = self.name, error = %e, "Periodic task did not exit cleanly");
        }
    }
}

impl std::fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("period", &self.period)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn counting_task(
        period: Duration,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> (PeriodicTask, Arc<AtomicUsize>) {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let task = PeriodicTask::spawn("test", period, shutdown, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        (task, ticks)
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_on_period() {
        let (task, ticks) = counting_task(ms(100), std::future::pending());

        // No tick fires immediately
        time::sleep(ms(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 0);

        time::sleep(ms(300)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_callbacks() {
        let (task, ticks) = counting_task(ms(100), std::future::pending());

        time::sleep(ms(250)).await;
        task.stop().await;
        assert!(!task.is_running());

        let after_stop = ticks.load(Ordering::SeqCst);
        time::sleep(ms(1000)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);

        // Second stop is a no-op
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_future_halts_task() {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (task, ticks) = counting_task(ms(100), async move {
            let _ = shutdown_rx.await;
        });

        time::sleep(ms(150)).await;
        assert!(task.is_running());
        shutdown_tx.send(()).unwrap();

        time::sleep(ms(500)).await;
        assert!(!task.is_running());
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // Stopping after an external shutdown still returns promptly
        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_tick_delays_next_deadline() {
        let (task, ticks) = counting_task(ms(100), std::future::pending());

        // Jump past several deadlines at once; only one tick should fire
        time::advance(ms(450)).await;
        time::sleep(ms(1)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        // Next deadline is one period after the late tick
        time::sleep(ms(98)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
        time::sleep(ms(2)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 2);

        task.stop().await;
    }

    #[test]
    fn test_spawn_outside_runtime_fails() {
        let result = PeriodicTask::spawn("test", ms(100), std::future::pending(), |_| {});
        assert!(matches!(result, Err(TollgateError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_zero_period_rejected() {
        let result = PeriodicTask::spawn("test", Duration::ZERO, std::future::pending(), |_| {});
        assert!(matches!(result, Err(TollgateError::InvalidParameter(_))));
    }
}
