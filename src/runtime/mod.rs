// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience primitives and observability.
//!
//! This module provides the building blocks the orchestrator composes: a
//! circuit breaker, a retry executor with jittered backoff, per-attempt
//! timeouts and a bulkhead, plus the clock abstraction and outcome sinks.

mod bulkhead;
mod circuit_breaker;
mod clock;
mod context;
mod events;
mod logging;
pub mod metrics;
mod retry;
mod timeout;
pub mod tracing;

pub use bulkhead::{AcquireError, Bulkhead, BulkheadStats, BulkheadTicket};
pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitOpen, CircuitState, Permission};
pub use clock::{Clock, ManualClock, Sleep, TokioClock};
pub use context::CallContext;
pub use events::{
    AttemptOutcome, BroadcastSink, EngineEvent, MulticastSink, NullSink, OutcomeEvent,
    OutcomeSink, RejectionEvent, RejectionSource,
};
pub use logging::{LogLevel, LogSink, LoggingConfig};
pub use metrics::{MetricsCollector, MetricsConfig, MetricsSnapshot};
pub use retry::{
    AlwaysRetry, DefaultRetryPredicate, DynError, ExponentialBackoff, NeverRetry, RetryExecutor,
    RetryOutput, RetryPredicate,
};
pub use timeout::{with_timeout, AttemptResult, TimeoutEnforcer};
