// SPDX-License-Identifier: MIT OR Apache-2.0

//! Span helpers for protected calls.
//!
//! Every attempt runs inside an `attempt` span carrying the operation name and
//! the 1-based attempt index. The outcome and the breaker state after the
//! attempt are recorded on the span once it ends, so any `tracing` subscriber
//! (including an OpenTelemetry layer) sees them as span attributes.
//!
//! | Attribute | Description |
//! |-----------|-------------|
//! | `resilience.operation` | Protected operation name |
//! | `resilience.attempt` | 1-based attempt index |
//! | `resilience.outcome` | `success`, `transient`, `permanent` or `timeout` |
//! | `resilience.breaker_state` | Breaker state after the attempt |
//! | `error.message` | Failure text, when the attempt failed |
//! | `duration_ms` | Attempt duration |
//!
//! # Example
//!
//! ```rust
//! use resilience_engine::runtime::tracing::AttemptSpan;
//!
//! let span = AttemptSpan::new("payments.charge", 1);
//! span.record_error("connection reset");
//! ```

use std::time::Duration;
use tracing::{field, info_span, Span};

use crate::runtime::events::OutcomeEvent;

/// Span covering one attempt.
#[derive(Debug, Clone)]
pub struct AttemptSpan {
    span: Span,
    attempt: u32,
}

impl AttemptSpan {
    /// Open a span for `attempt` of `operation`.
    pub fn new(operation: &str, attempt: u32) -> Self {
        let span = info_span!(
            "attempt",
            resilience.operation = %operation,
            resilience.attempt = attempt,
            resilience.outcome = field::Empty,
            resilience.breaker_state = field::Empty,
            error.message = field::Empty,
            duration_ms = field::Empty,
        );

        Self { span, attempt }
    }

    /// The underlying `tracing::Span`.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The attempt index.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Record how the attempt ended.
    pub fn record_outcome(&self, event: &OutcomeEvent) {
        self.span
            .record("resilience.outcome", event.outcome.label());
        self.span.record(
            "resilience.breaker_state",
            field::display(event.breaker_state_after),
        );
        self.record_duration(event.elapsed);
    }

    /// Record a failure message.
    pub fn record_error(&self, error: &str) {
        self.span.record("error.message", error);
    }

    fn record_duration(&self, duration: Duration) {
        self.span
            .record("duration_ms", u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
    }
}

/// Span covering a whole protected call, parent of its attempt spans.
pub fn call_span(operation: &str) -> Span {
    info_span!(
        "resilient_call",
        resilience.operation = %operation,
        resilience.attempts = field::Empty,
        otel.status_code = field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::circuit_breaker::CircuitState;
    use crate::runtime::events::AttemptOutcome;

    #[test]
    fn test_attempt_span_new() {
        let span = AttemptSpan::new("inventory.lookup", 2);
        assert_eq!(span.attempt(), 2);
    }

    #[test]
    fn test_attempt_span_record_outcome() {
        let span = AttemptSpan::new("inventory.lookup", 1);
        span.record_outcome(&OutcomeEvent {
            operation: "inventory.lookup".to_string(),
            attempt_index: 1,
            outcome: AttemptOutcome::timeout(1, Duration::from_millis(50)),
            breaker_state_after: CircuitState::Open,
            elapsed: Duration::from_millis(50),
        });
        span.record_error("timed out");
        // Span should not panic
    }

    #[test]
    fn test_call_span_fields() {
        let span = call_span("inventory.lookup");
        span.record("resilience.attempts", 3u32);
        span.record("otel.status_code", "OK");
    }
}
