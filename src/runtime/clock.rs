// SPDX-License-Identifier: MIT OR Apache-2.0

//! Monotonic time and delay primitives.
//!
//! The circuit breaker reads time through [`Clock::now`] and the retry executor
//! sleeps through [`Clock::sleep`], so tests can swap in a [`ManualClock`] and
//! drive both deterministically.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// A boxed, sendable future returned by [`Clock::sleep`].
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Source of monotonic time and delays.
pub trait Clock: Send + Sync + 'static {
    /// Current monotonic instant.
    fn now(&self) -> Instant;

    /// A future that completes after `duration`.
    fn sleep(&self, duration: Duration) -> Sleep;
}

/// Clock backed by the tokio timer.
///
/// Honours `tokio::time::pause`, so paused-time tests work unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Hand-driven clock for deterministic tests.
///
/// `sleep` completes immediately, advances the clock by the requested amount
/// and records the duration so tests can assert on backoff delays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    base: Instant,
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().expect("lock poisoned");
        state.offset += by;
    }

    /// Total time advanced since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.inner.lock().expect("lock poisoned").offset
    }

    /// Every duration passed to `sleep`, in call order.
    #[must_use]
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().expect("lock poisoned").sleeps.clone()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.inner.lock().expect("lock poisoned");
        state.base + state.offset
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        {
            let mut state = self.inner.lock().expect("lock poisoned");
            state.offset += duration;
            state.sleeps.push(duration);
        }
        Box::pin(std::future::ready(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now() - start, Duration::from_secs(5));
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_manual_clock_sleep_records() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.sleep(Duration::from_millis(100)).await;
        clock.sleep(Duration::from_millis(250)).await;

        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(250)]
        );
        assert_eq!(clock.now() - start, Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_sleep() {
        let clock = TokioClock;
        let start = clock.now();
        clock.sleep(Duration::from_millis(40)).await;
        assert!(clock.now() - start >= Duration::from_millis(40));
    }
}
