// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-attempt timeout enforcement.
//!
//! Each attempt runs under a child of the caller's cancellation token. When the
//! deadline passes first, the child token is cancelled and the attempt's future
//! is dropped; its eventual result is never observed.
//!
//! Cancellation is cooperative for work the callable hands off elsewhere: a
//! callable that spawns tasks and ignores its token can keep them running
//! after a timeout.
//!
//! # Example
//!
//! ```
//! use resilience_engine::runtime::{with_timeout, AttemptResult, CallContext};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let ctx = CallContext::new();
//! let (result, _elapsed) = with_timeout(Duration::from_secs(1), &ctx, |_token| async {
//!     Ok::<_, std::io::Error>(7)
//! })
//! .await;
//! assert!(matches!(result, AttemptResult::Completed(Ok(7))));
//! # }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BoxError;
use crate::runtime::context::{deadline_after, CallContext};

/// How a single attempt ended.
#[derive(Debug)]
pub enum AttemptResult<T> {
    /// The callable finished; its result is passed through unchanged.
    Completed(std::result::Result<T, BoxError>),
    /// The per-attempt duration elapsed first.
    TimedOut(Duration),
    /// The caller cancelled.
    Cancelled,
    /// The caller's deadline elapsed first.
    DeadlineExceeded,
}

impl<T> AttemptResult<T> {
    /// Returns `true` if the callable ran to completion.
    pub fn is_completed(&self) -> bool {
        matches!(self, AttemptResult::Completed(_))
    }
}

/// Bounds one attempt by a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutEnforcer {
    per_attempt: Duration,
}

impl TimeoutEnforcer {
    /// Create an enforcer.
    #[must_use]
    pub fn new(per_attempt: Duration) -> Self {
        Self { per_attempt }
    }

    /// The per-attempt duration.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.per_attempt
    }

    /// Run one attempt and report how it ended and how long it took.
    pub async fn run<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        operation: F,
    ) -> (AttemptResult<T>, Duration)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let start = Instant::now();

        if ctx.is_cancelled() {
            return (AttemptResult::Cancelled, Duration::ZERO);
        }

        let (deadline, caller_bound) = ctx.bound(deadline_after(start, self.per_attempt));
        let attempt_token = ctx.token().child_token();
        let attempt = operation(attempt_token.clone());

        let result = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => AttemptResult::Cancelled,
            res = tokio::time::timeout_at(deadline, attempt) => match res {
                Ok(r) => AttemptResult::Completed(r.map_err(Into::into)),
                Err(_) if caller_bound => AttemptResult::DeadlineExceeded,
                Err(_) => AttemptResult::TimedOut(self.per_attempt),
            },
        };

        if !result.is_completed() {
            attempt_token.cancel();
        }
        if let AttemptResult::TimedOut(after) = &result {
            warn!(
                target: "resilience_engine::timeout",
                duration = ?after,
                "attempt timed out"
            );
        }

        (result, start.elapsed())
    }
}

/// Run `operation` bounded by `duration` and the caller's context.
pub async fn with_timeout<T, E, F, Fut>(
    duration: Duration,
    ctx: &CallContext,
    operation: F,
) -> (AttemptResult<T>, Duration)
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Into<BoxError>,
{
    TimeoutEnforcer::new(duration).run(ctx, operation).await
}
