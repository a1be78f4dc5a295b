// SPDX-License-Identifier: MIT OR Apache-2.0

//! Caller-supplied cancellation and deadline.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Roughly 30 years, the horizon used for "no limit" deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + after`, saturating to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Cancellation signal and optional deadline for one protected call.
///
/// Cancelling the token aborts a bulkhead wait, a backoff sleep or an
/// in-flight attempt. The deadline caps every per-attempt timeout: the
/// effective bound is whichever comes first.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context with a fresh token and no deadline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Set an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set a deadline relative to now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(deadline_after(Instant::now(), timeout))
    }

    /// The cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the token is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Time left before the deadline; `None` without a deadline.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` if the deadline has passed.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Earlier of `bound` and the deadline, and whether the deadline won.
    pub(crate) fn bound(&self, bound: Instant) -> (Instant, bool) {
        match self.deadline {
            Some(deadline) if deadline <= bound => (deadline, true),
            _ => (bound, false),
        }
    }
}
