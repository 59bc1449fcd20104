//! Monotonic time and cancellable one-shot timers.
//!
//! The coordinator never reads the clock directly; it goes through the
//! [`Clock`] trait so tests can drive time with tokio's paused runtime
//! (`tokio::time::Instant` honours `start_paused`).

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant, used for deadlines and enqueue ordering.
    fn now(&self) -> Instant;
    /// Wall-clock timestamp, used for persisted records.
    fn wall(&self) -> DateTime<Utc>;
}

/// Default clock backed by the tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A one-shot timer that is cancelled when the guard drops, so a timer can
/// never outlive the scope (ballot, coordinator) that created it.
#[derive(Debug)]
pub struct TimerGuard {
    handle: Option<JoinHandle<()>>,
}

impl TimerGuard {
    pub fn spawn_at<F>(deadline: Instant, fut: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            fut.await;
        });
        Self {
            handle: Some(handle),
        }
    }

    /// Release the timer without cancelling it. Required when the guard is
    /// dropped from inside the timer's own callback: aborting there would
    /// kill the callback mid-flight.
    pub fn disarm(&mut self) {
        self.handle.take();
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn timer_fires_at_deadline() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let _guard = TimerGuard::spawn_at(Instant::now() + Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!fired.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_timer_never_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let guard = TimerGuard::spawn_at(Instant::now() + Duration::from_secs(5), async move {
            flag.store(true, Ordering::SeqCst);
        });
        drop(guard);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
