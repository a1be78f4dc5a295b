// SPDX-License-Identifier: MIT OR Apache-2.0

//! The public entry point for protected calls.
//!
//! [`ResilienceOrchestrator`] owns one breaker, one bulkhead and one retry
//! executor per registered operation, built once from the
//! [`PolicyRegistry`]. Each call is composed as
//! Bulkhead → Circuit Breaker → Retry → Timeout → callable.
//!
//! # Example
//!
//! ```
//! use resilience_engine::config::{PolicyConfig, PolicyRegistry};
//! use resilience_engine::{CallError, ResilienceOrchestrator};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PolicyRegistry::builder()
//!     .with_policy(PolicyConfig::new("profile-service"))
//!     .build()?;
//! let engine = ResilienceOrchestrator::new(registry)?;
//!
//! let output = engine
//!     .execute("profile-service", |_token| async { Ok::<_, CallError>("alice") })
//!     .await?;
//! assert_eq!(output.value, "alice");
//! assert_eq!(output.attempts, 1);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

use crate::config::{PolicyConfig, PolicyRegistry};
use crate::error::{BoxError, ResilienceError, Result};
use crate::runtime::tracing::call_span;
use crate::runtime::{
    AcquireError, BreakerState, Bulkhead, BulkheadStats, CallContext, CircuitBreaker, Clock,
    NullSink, OutcomeSink, RejectionEvent, RejectionSource, RetryExecutor, TimeoutEnforcer,
    TokioClock,
};

/// Successful result of a protected call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutput<T> {
    pub value: T,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    /// Wall time from admission request to completion.
    pub elapsed: Duration,
}

/// Result of [`ResilienceOrchestrator::execute`].
pub type CallResult<T> = Result<CallOutput<T>>;

/// Per-operation runtime state.
struct OperationSlot {
    policy: Arc<PolicyConfig>,
    bulkhead: Bulkhead,
    executor: RetryExecutor,
}

/// Composes the resilience primitives around caller-supplied operations.
pub struct ResilienceOrchestrator {
    registry: PolicyRegistry,
    slots: HashMap<String, OperationSlot>,
    sink: Arc<dyn OutcomeSink>,
}

impl fmt::Debug for ResilienceOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceOrchestrator")
            .field("operations", &self.registry.operations())
            .finish()
    }
}

impl ResilienceOrchestrator {
    /// Build with the tokio clock and no event sink.
    ///
    /// # Errors
    ///
    /// Returns an error if a policy refers to an unregistered predicate.
    pub fn new(registry: PolicyRegistry) -> Result<Self> {
        Self::builder(registry).build()
    }

    /// Start configuring an orchestrator.
    #[must_use]
    pub fn builder(registry: PolicyRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            sink: Arc::new(NullSink),
            clock: Arc::new(TokioClock),
        }
    }

    /// Run `callable` under the policy registered for `operation`.
    ///
    /// The callable receives a cancellation token that fires when its attempt
    /// times out.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`ResilienceError`] of the call.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, callable: F) -> CallResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.execute_with(operation, &CallContext::new(), callable)
            .await
    }

    /// Run `callable` with caller-supplied cancellation and deadline.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] before doing anything else
    /// if no policy is registered for `operation`; otherwise the terminal
    /// error of the call.
    pub async fn execute_with<T, E, F, Fut>(
        &self,
        operation: &str,
        ctx: &CallContext,
        callable: F,
    ) -> CallResult<T>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        let slot = self.slot(operation)?;
        let span = call_span(operation);

        async {
            let start = Instant::now();

            let ticket = match slot
                .bulkhead
                .acquire(slot.policy.bulkhead.queue_timeout, ctx)
                .await
            {
                Ok(ticket) => ticket,
                Err(AcquireError::Rejected(reason)) => {
                    self.sink.on_rejection(&RejectionEvent {
                        operation: operation.to_string(),
                        source: RejectionSource::Bulkhead(reason),
                        attempts: 0,
                    });
                    return Err(ResilienceError::BulkheadRejected {
                        operation: operation.to_string(),
                        reason,
                    });
                }
                Err(AcquireError::Cancelled) => {
                    return Err(ResilienceError::Cancelled {
                        operation: operation.to_string(),
                        attempts: 0,
                    });
                }
                Err(AcquireError::DeadlineExceeded) => {
                    return Err(ResilienceError::DeadlineExceeded {
                        operation: operation.to_string(),
                        attempts: 0,
                    });
                }
            };

            let result = slot.executor.run(ctx, callable).await;
            ticket.release();

            let current = tracing::Span::current();
            match &result {
                Ok(out) => {
                    current.record("resilience.attempts", out.attempts);
                    current.record("otel.status_code", "OK");
                }
                Err(e) => {
                    current.record("resilience.attempts", e.attempts());
                    current.record("otel.status_code", "ERROR");
                    debug!(
                        target: "resilience_engine::orchestrator",
                        operation,
                        kind = %e.kind(),
                        "protected call failed"
                    );
                }
            }

            result.map(|out| CallOutput {
                value: out.value,
                attempts: out.attempts,
                elapsed: start.elapsed(),
            })
        }
        .instrument(span)
        .await
    }

    /// Snapshot of the breaker for `operation`.
    ///
    /// Side-effect free: repeated calls without intervening traffic return
    /// identical snapshots.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] for unregistered names.
    pub fn current_state(&self, operation: &str) -> Result<BreakerState> {
        Ok(self.slot(operation)?.executor.breaker().current_state())
    }

    /// Force the breaker for `operation` back to closed.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] for unregistered names.
    pub fn reset(&self, operation: &str) -> Result<()> {
        self.slot(operation)?.executor.breaker().reset();
        Ok(())
    }

    /// The breaker protecting `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] for unregistered names.
    pub fn breaker(&self, operation: &str) -> Result<&CircuitBreaker> {
        Ok(self.slot(operation)?.executor.breaker())
    }

    /// Bulkhead statistics for `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] for unregistered names.
    pub fn bulkhead_stats(&self, operation: &str) -> Result<BulkheadStats> {
        Ok(self.slot(operation)?.bulkhead.stats())
    }

    /// The policy applied to `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::UnknownOperation`] for unregistered names.
    pub fn policy(&self, operation: &str) -> Result<&PolicyConfig> {
        Ok(self.slot(operation)?.policy.as_ref())
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        self.registry.operations()
    }

    /// The policy registry.
    #[must_use]
    pub fn registry(&self) -> &PolicyRegistry {
        &self.registry
    }

    fn slot(&self, operation: &str) -> Result<&OperationSlot> {
        self.slots
            .get(operation)
            .ok_or_else(|| ResilienceError::UnknownOperation(operation.to_string()))
    }
}

/// Builder for [`ResilienceOrchestrator`].
pub struct OrchestratorBuilder {
    registry: PolicyRegistry,
    sink: Arc<dyn OutcomeSink>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for OrchestratorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrchestratorBuilder")
            .field("registry", &self.registry)
            .finish()
    }
}

impl OrchestratorBuilder {
    /// Send attempt and rejection events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Read breaker time and sleep between retries on `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create the per-operation state.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::InvalidPolicy`] if a policy refers to a
    /// predicate the registry does not know.
    pub fn build(self) -> Result<ResilienceOrchestrator> {
        let mut slots = HashMap::with_capacity(self.registry.len());

        for operation in self.registry.operations() {
            let policy = self
                .registry
                .policy(operation)
                .ok_or_else(|| ResilienceError::UnknownOperation(operation.to_string()))?;
            let predicate = self.registry.predicate(&policy.retry.retryable).ok_or_else(|| {
                ResilienceError::InvalidPolicy {
                    operation: operation.to_string(),
                    reason: format!("unknown retry predicate '{}'", policy.retry.retryable),
                }
            })?;

            let breaker = CircuitBreaker::with_clock(
                operation,
                policy.circuit_breaker.clone(),
                Arc::clone(&self.clock),
            );
            let executor = RetryExecutor::new(
                &policy.retry,
                predicate,
                breaker,
                TimeoutEnforcer::new(policy.timeout.per_attempt),
            )
            .with_clock(Arc::clone(&self.clock))
            .with_sink(Arc::clone(&self.sink));

            slots.insert(
                operation.to_string(),
                OperationSlot {
                    bulkhead: Bulkhead::new(operation, policy.bulkhead.clone()),
                    executor,
                    policy,
                },
            );
        }

        Ok(ResilienceOrchestrator {
            registry: self.registry,
            slots,
            sink: self.sink,
        })
    }
}
