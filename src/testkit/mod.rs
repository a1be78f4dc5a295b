// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scripted callables for exercising the engine in tests and demos.
//!
//! A [`ScriptedCall`] plays back a list of [`Step`]s, one per invocation, and
//! repeats the last step once the script runs out. It counts invocations,
//! tracks how many run at once and notices when an attempt's token fires.
//!
//! ```
//! use resilience_engine::testkit::{ScriptedCall, Step};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let call = ScriptedCall::new(vec![Step::transient("reset"), Step::Succeed(7)]);
//! let token = tokio_util::sync::CancellationToken::new();
//!
//! assert!(call.call(token.clone()).await.is_err());
//! assert_eq!(call.call(token).await.unwrap(), 7);
//! assert_eq!(call.calls(), 2);
//! # }
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::CallError;

/// What one invocation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step<T> {
    /// Return the value.
    Succeed(T),
    /// Fail with [`CallError::Transient`].
    Transient(String),
    /// Fail with [`CallError::Permanent`].
    Permanent(String),
    /// Wait, then perform the inner step.
    Delayed(Duration, Box<Step<T>>),
    /// Never finish until the attempt token is cancelled.
    Hang,
}

impl<T> Step<T> {
    /// A transient failure.
    pub fn transient(msg: impl Into<String>) -> Self {
        Step::Transient(msg.into())
    }

    /// A permanent failure.
    pub fn permanent(msg: impl Into<String>) -> Self {
        Step::Permanent(msg.into())
    }

    /// Perform `self` after `delay`.
    #[must_use]
    pub fn after(self, delay: Duration) -> Self {
        Step::Delayed(delay, Box::new(self))
    }
}

#[derive(Debug)]
struct Script<T> {
    steps: Mutex<VecDeque<Step<T>>>,
    last: Mutex<Option<Step<T>>>,
    calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    cancelled: AtomicU32,
}

struct InFlight<'a>(&'a AtomicU32);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A callable that follows a script.
#[derive(Debug)]
pub struct ScriptedCall<T> {
    script: Arc<Script<T>>,
}

impl<T> Clone for ScriptedCall<T> {
    fn clone(&self) -> Self {
        Self {
            script: Arc::clone(&self.script),
        }
    }
}

impl<T: Clone + Send + 'static> ScriptedCall<T> {
    /// Play `steps` in order, then keep repeating the last one.
    pub fn new(steps: impl IntoIterator<Item = Step<T>>) -> Self {
        Self {
            script: Arc::new(Script {
                steps: Mutex::new(steps.into_iter().collect()),
                last: Mutex::new(None),
                calls: AtomicU32::new(0),
                in_flight: AtomicU32::new(0),
                max_in_flight: AtomicU32::new(0),
                cancelled: AtomicU32::new(0),
            }),
        }
    }

    /// Perform `step` on every invocation.
    pub fn always(step: Step<T>) -> Self {
        Self::new([step])
    }

    /// Fail transiently `failures` times, then succeed with `value`.
    pub fn succeed_after(failures: usize, value: T) -> Self {
        let mut steps: Vec<_> = (0..failures)
            .map(|i| Step::transient(format!("scripted failure {}", i + 1)))
            .collect();
        steps.push(Step::Succeed(value));
        Self::new(steps)
    }

    /// Invocations so far.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.script.calls.load(Ordering::SeqCst)
    }

    /// Invocations currently running.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.script.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of invocations seen running at once.
    #[must_use]
    pub fn max_in_flight(&self) -> u32 {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }

    /// Invocations that observed their token being cancelled.
    #[must_use]
    pub fn cancelled(&self) -> u32 {
        self.script.cancelled.load(Ordering::SeqCst)
    }

    fn next_step(&self) -> Option<Step<T>> {
        let mut steps = self.script.steps.lock().expect("lock poisoned");
        let mut last = self.script.last.lock().expect("lock poisoned");
        match steps.pop_front() {
            Some(step) => {
                *last = Some(step.clone());
                Some(step)
            }
            None => last.clone(),
        }
    }

    /// Run the next step of the script.
    pub fn call(
        &self,
        token: CancellationToken,
    ) -> impl Future<Output = Result<T, CallError>> + Send + 'static {
        let script = Arc::clone(&self.script);
        script.calls.fetch_add(1, Ordering::SeqCst);

        let mut delay = Duration::ZERO;
        let mut step = self.next_step();
        while let Some(Step::Delayed(d, inner)) = step {
            delay += d;
            step = Some(*inner);
        }

        async move {
            let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            script.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&script.in_flight);

            let finished = if matches!(step, Some(Step::Hang)) {
                token.cancelled().await;
                false
            } else if delay.is_zero() {
                true
            } else {
                tokio::select! {
                    _ = token.cancelled() => false,
                    _ = tokio::time::sleep(delay) => true,
                }
            };
            if !finished {
                script.cancelled.fetch_add(1, Ordering::SeqCst);
                return Err(CallError::transient("attempt cancelled"));
            }

            match step {
                Some(Step::Succeed(value)) => Ok(value),
                Some(Step::Transient(msg)) => Err(CallError::Transient(msg)),
                Some(Step::Permanent(msg)) => Err(CallError::Permanent(msg)),
                Some(Step::Delayed(..)) | Some(Step::Hang) | None => {
                    Err(CallError::permanent("script is empty"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_script_repeats_last_step() {
        let call = ScriptedCall::new(vec![Step::Succeed(1), Step::Succeed(2)]);
        let token = CancellationToken::new();

        assert_eq!(call.call(token.clone()).await.unwrap(), 1);
        assert_eq!(call.call(token.clone()).await.unwrap(), 2);
        assert_eq!(call.call(token).await.unwrap(), 2);
        assert_eq!(call.calls(), 3);
    }

    #[tokio::test]
    async fn test_succeed_after() {
        let call = ScriptedCall::succeed_after(2, "ok");
        let token = CancellationToken::new();

        assert!(matches!(call.call(token.clone()).await, Err(CallError::Transient(_))));
        assert!(matches!(call.call(token.clone()).await, Err(CallError::Transient(_))));
        assert_eq!(call.call(token).await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_empty_script() {
        let call = ScriptedCall::<()>::new(Vec::new());
        let result = call.call(CancellationToken::new()).await;
        assert!(matches!(result, Err(CallError::Permanent(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_until_cancelled() {
        let call = ScriptedCall::<()>::always(Step::Hang);
        let token = CancellationToken::new();
        let pending = tokio::spawn(call.call(token.clone()));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(call.in_flight(), 1);
        token.cancel();

        assert!(pending.await.unwrap().is_err());
        assert_eq!(call.cancelled(), 1);
        assert_eq!(call.in_flight(), 0);
        assert_eq!(call.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_step() {
        let call = ScriptedCall::always(Step::Succeed(9).after(Duration::from_millis(30)));
        let start = tokio::time::Instant::now();
        assert_eq!(call.call(CancellationToken::new()).await.unwrap(), 9);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
