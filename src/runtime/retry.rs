// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry loop with exponential backoff and full jitter.
//!
//! The [`RetryExecutor`] drives up to `max_attempts` attempts of one call. The
//! circuit breaker is consulted before every attempt, every attempt runs under
//! the per-attempt timeout, and every attempt's outcome is reported to the
//! breaker and to the outcome sink.
//!
//! # Example
//!
//! ```
//! use resilience_engine::config::RetryConfig;
//! use resilience_engine::runtime::ExponentialBackoff;
//! use std::time::Duration;
//!
//! let backoff = ExponentialBackoff::from_config(
//!     &RetryConfig::new()
//!         .with_base_delay(Duration::from_millis(100))
//!         .with_max_delay(Duration::from_secs(1)),
//! );
//! assert_eq!(backoff.cap(3), Duration::from_millis(400));
//! assert!(backoff.delay(3) <= Duration::from_millis(400));
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use crate::config::RetryConfig;
use crate::error::{AttemptError, BoxError, CallError, ErrorKind, ResilienceError, Result};
use crate::runtime::circuit_breaker::{CircuitBreaker, Permission};
use crate::runtime::clock::{Clock, TokioClock};
use crate::runtime::context::CallContext;
use crate::runtime::events::{
    AttemptOutcome, NullSink, OutcomeEvent, OutcomeSink, RejectionEvent, RejectionSource,
};
use crate::runtime::timeout::{AttemptResult, TimeoutEnforcer};
use crate::runtime::tracing::AttemptSpan;

/// Error type seen by retry predicates.
pub type DynError = dyn std::error::Error + Send + Sync + 'static;

// =============================================================================
// Retry Predicate
// =============================================================================

/// Classifies a callable's error as retryable or not.
///
/// Per-attempt timeouts are classified too, as [`AttemptError::Timeout`].
pub trait RetryPredicate: Send + Sync + 'static {
    /// Returns `true` if the call should be attempted again after `error`.
    fn is_retryable(&self, error: &DynError) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&DynError) -> bool + Send + Sync + 'static,
{
    fn is_retryable(&self, error: &DynError) -> bool {
        self(error)
    }
}

/// Retries everything except [`CallError::Permanent`], timeouts included.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPredicate;

impl RetryPredicate for DefaultRetryPredicate {
    fn is_retryable(&self, error: &DynError) -> bool {
        !matches!(error.downcast_ref::<CallError>(), Some(CallError::Permanent(_)))
    }
}

/// Retries every error.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl RetryPredicate for AlwaysRetry {
    fn is_retryable(&self, _error: &DynError) -> bool {
        true
    }
}

/// Never retries, not even a timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl RetryPredicate for NeverRetry {
    fn is_retryable(&self, _error: &DynError) -> bool {
        false
    }
}

// =============================================================================
// Exponential Backoff
// =============================================================================

/// Exponential backoff with jitter.
///
/// The cap for the delay after attempt `k` is
/// `min(max_delay, base_delay * 2^(k-1))`. The actual delay is drawn from
/// `[cap * (1 - jitter_fraction), cap]`; a fraction of `1.0` is full jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    jitter_fraction: f64,
}

impl ExponentialBackoff {
    /// Create a full-jitter backoff.
    #[must_use]
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_fraction: 1.0,
        }
    }

    /// Build from a retry policy.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.base_delay, config.max_delay).with_jitter_fraction(config.jitter_fraction)
    }

    /// Set the jitter fraction, clamped to `[0, 1]`.
    #[must_use]
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = if fraction.is_nan() {
            1.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self
    }

    /// Upper bound of the delay after the 1-based `attempt`.
    #[must_use]
    pub fn cap(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Jittered delay after the 1-based `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, rand::random::<f64>())
    }

    /// Delay for a given random draw `r` in `[0, 1)`.
    #[must_use]
    pub fn delay_with(&self, attempt: u32, r: f64) -> Duration {
        let cap = self.cap(attempt);
        let scale = 1.0 - self.jitter_fraction * r.clamp(0.0, 1.0);
        if scale >= 1.0 {
            return cap;
        }
        cap.mul_f64(scale).min(cap)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

// =============================================================================
// Retry Executor
// =============================================================================

/// Successful result of a retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOutput<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
}

enum Interrupted {
    Cancelled,
    Deadline,
}

/// Drives the attempts of one call for one operation.
pub struct RetryExecutor {
    operation: String,
    max_attempts: u32,
    backoff: ExponentialBackoff,
    predicate: Arc<dyn RetryPredicate>,
    timeout: TimeoutEnforcer,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn OutcomeSink>,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("operation", &self.operation)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RetryExecutor {
    /// Create an executor that sleeps on the tokio clock and discards events.
    pub fn new(
        config: &RetryConfig,
        predicate: Arc<dyn RetryPredicate>,
        breaker: CircuitBreaker,
        timeout: TimeoutEnforcer,
    ) -> Self {
        Self {
            operation: breaker.operation().to_string(),
            max_attempts: config.max_attempts.max(1),
            backoff: ExponentialBackoff::from_config(config),
            predicate,
            timeout,
            breaker,
            clock: Arc::new(TokioClock),
            sink: Arc::new(NullSink),
        }
    }

    /// Sleep between attempts on `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Emit events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The breaker consulted before every attempt.
    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// The backoff schedule.
    #[must_use]
    pub fn backoff(&self) -> &ExponentialBackoff {
        &self.backoff
    }

    /// Run `operation` until it succeeds, fails permanently, runs out of
    /// attempts, or is stopped by the breaker or the caller.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ResilienceError`] of the call. A breaker
    /// rejection does not consume an attempt.
    pub async fn run<T, E, F, Fut>(&self, ctx: &CallContext, mut operation: F) -> Result<RetryOutput<T>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let mut attempt: u32 = 1;

        loop {
            let made = attempt - 1;
            if ctx.is_cancelled() {
                return Err(self.cancelled(made));
            }
            if ctx.is_expired() {
                return Err(self.deadline_exceeded(made));
            }

            let permission = match self.breaker.permit() {
                Ok(permission) => permission,
                Err(open) => {
                    debug!(
                        target: "resilience_engine::retry",
                        operation = %self.operation,
                        attempts = made,
                        "circuit open, not attempting"
                    );
                    self.sink.on_rejection(&RejectionEvent {
                        operation: self.operation.clone(),
                        source: RejectionSource::CircuitBreaker,
                        attempts: made,
                    });
                    return Err(ResilienceError::CircuitOpen {
                        operation: self.operation.clone(),
                        attempts: made,
                        retry_after: open.retry_after,
                    });
                }
            };

            let span = AttemptSpan::new(&self.operation, attempt);
            let (result, elapsed) = self
                .timeout
                .run(ctx, |token| operation(token))
                .instrument(span.span().clone())
                .await;

            let (error, retryable, kind) = match result {
                AttemptResult::Completed(Ok(value)) => {
                    let outcome = AttemptOutcome::success(attempt, elapsed);
                    self.settle(permission, &outcome, &span);
                    return Ok(RetryOutput {
                        value,
                        attempts: attempt,
                    });
                }
                AttemptResult::Completed(Err(e)) => {
                    let retryable = self.predicate.is_retryable(e.as_ref());
                    let kind = if retryable {
                        ErrorKind::Transient
                    } else {
                        ErrorKind::Permanent
                    };
                    span.record_error(&e.to_string());
                    (AttemptError::Failed(e), retryable, kind)
                }
                AttemptResult::TimedOut(after) => {
                    let error = AttemptError::Timeout(after);
                    let retryable = self.predicate.is_retryable(&error);
                    (error, retryable, ErrorKind::Timeout)
                }
                // Caller-side stops say nothing about the dependency.
                AttemptResult::Cancelled => {
                    drop(permission);
                    return Err(self.cancelled(attempt));
                }
                AttemptResult::DeadlineExceeded => {
                    drop(permission);
                    return Err(self.deadline_exceeded(attempt));
                }
            };

            let outcome = AttemptOutcome::failure(attempt, kind, elapsed);
            self.settle(permission, &outcome, &span);

            if !retryable {
                debug!(
                    target: "resilience_engine::retry",
                    operation = %self.operation,
                    attempt,
                    error = %error,
                    "non-retryable failure"
                );
                return Err(ResilienceError::Permanent {
                    operation: self.operation.clone(),
                    attempts: attempt,
                    source: error,
                });
            }

            if attempt >= self.max_attempts {
                warn!(
                    target: "resilience_engine::retry",
                    operation = %self.operation,
                    attempts = attempt,
                    error = %error,
                    "retries exhausted"
                );
                return Err(ResilienceError::ExhaustedRetries {
                    operation: self.operation.clone(),
                    attempts: attempt,
                    last: error,
                });
            }

            let delay = self.backoff.delay(attempt);
            debug!(
                target: "resilience_engine::retry",
                operation = %self.operation,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retrying after backoff"
            );

            match self.pause(ctx, delay).await {
                Ok(()) => {}
                Err(Interrupted::Cancelled) => return Err(self.cancelled(attempt)),
                Err(Interrupted::Deadline) => return Err(self.deadline_exceeded(attempt)),
            }

            attempt += 1;
        }
    }

    fn settle(&self, permission: Permission, outcome: &AttemptOutcome, span: &AttemptSpan) {
        let state = self.breaker.record_outcome(permission, outcome);
        let event = OutcomeEvent {
            operation: self.operation.clone(),
            attempt_index: outcome.attempt_index,
            outcome: *outcome,
            breaker_state_after: state,
            elapsed: outcome.elapsed,
        };
        span.record_outcome(&event);
        self.sink.on_attempt(&event);
    }

    async fn pause(&self, ctx: &CallContext, delay: Duration) -> std::result::Result<(), Interrupted> {
        let deadline = async {
            match ctx.deadline() {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::Deadline),
            _ = self.clock.sleep(delay) => Ok(()),
        }
    }

    fn cancelled(&self, attempts: u32) -> ResilienceError {
        ResilienceError::Cancelled {
            operation: self.operation.clone(),
            attempts,
        }
    }

    fn deadline_exceeded(&self, attempts: u32) -> ResilienceError {
        ResilienceError::DeadlineExceeded {
            operation: self.operation.clone(),
            attempts,
        }
    }
}
