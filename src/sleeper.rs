//! Timer abstraction used to schedule delayed queue flushes.
//!
//! The queue never calls `tokio::time::sleep` directly; it asks its [`Sleeper`] for a
//! future that completes after the flush delay. Tests swap in [`InstantSleeper`] or a
//! [`TrackingSleeper`] to observe or skip the wait.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Boxed future returned by a [`Sleeper`].
pub type SleepFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Schedules "wake me after `duration`".
///
/// The deadline is fixed when `sleep` is called, not when the future is first polled.
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> SleepFuture;
}

impl<T: Sleeper + ?Sized> Sleeper for Arc<T> {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        (**self).sleep(duration)
    }
}

/// Production sleeper using the tokio timer (honours paused test time).
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that completes immediately; scheduled flushes fire on the next scheduler tick.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

impl Sleeper for InstantSleeper {
    fn sleep(&self, _duration: Duration) -> SleepFuture {
        Box::pin(async {})
    }
}

/// Records every requested delay, then defers to an inner sleeper.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    inner: Arc<dyn Sleeper>,
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl TrackingSleeper {
    /// Tracking sleeper that does not actually wait.
    pub fn new() -> Self {
        Self::wrap(InstantSleeper)
    }

    pub fn wrap<S: Sleeper + 'static>(inner: S) -> Self {
        Self { inner: Arc::new(inner), calls: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl Sleeper for TrackingSleeper {
    fn sleep(&self, duration: Duration) -> SleepFuture {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        self.inner.sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let start = std::time::Instant::now();
        InstantSleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls() {
        let sleeper = TrackingSleeper::new();

        sleeper.sleep(Duration::from_millis(50)).await;
        sleeper.sleep(Duration::from_millis(75)).await;

        assert_eq!(sleeper.calls(), vec![Duration::from_millis(50), Duration::from_millis(75)]);
        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_deadline_is_fixed_at_creation() {
        let start = tokio::time::Instant::now();
        let sleep = TokioSleeper.sleep(Duration::from_millis(50));
        tokio::time::advance(Duration::from_millis(30)).await;
        sleep.await;
        assert_eq!(start.elapsed(), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn tracking_sleeper_delegates_to_inner() {
        let sleeper = TrackingSleeper::wrap(TokioSleeper);
        let start = tokio::time::Instant::now();
        sleeper.sleep(Duration::from_millis(20)).await;
        assert_eq!(start.elapsed(), Duration::from_millis(20));
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(20)]);
    }
}
