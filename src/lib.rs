// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilience policies for calls to unreliable dependencies.
//!
//! Register a policy per operation, then run calls through
//! [`ResilienceOrchestrator::execute`], which composes a bulkhead, a circuit
//! breaker, retries with jittered exponential backoff and per-attempt
//! timeouts around the caller's callable.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod runtime;
pub mod testkit;

pub use config::{PolicyConfig, PolicyRegistry};
pub use error::{CallError, ErrorKind, ResilienceError, Result};
pub use orchestrator::{CallOutput, CallResult, OrchestratorBuilder, ResilienceOrchestrator};
pub use runtime::{BreakerState, CallContext, CircuitState, OutcomeEvent, OutcomeSink};
