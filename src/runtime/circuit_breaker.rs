// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker state machine for one protected operation.
//!
//! The circuit breaker prevents cascading failures by temporarily stopping
//! calls to a failing dependency and allowing it to recover.
//!
//! # States
//!
//! - **Closed**: calls pass through; failures are counted over a window
//! - **Open**: calls are rejected without being attempted
//! - **Half-Open**: exactly one probe call at a time tests recovery
//!
//! The `Open -> HalfOpen` transition is evaluated lazily inside
//! [`CircuitBreaker::permit`]; no timer task is ever spawned.
//!
//! # Example
//!
//! ```
//! use resilience_engine::config::CircuitBreakerConfig;
//! use resilience_engine::runtime::{AttemptOutcome, CircuitBreaker, CircuitState};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new("orders-db", CircuitBreakerConfig::new().with_failure_threshold(1));
//!
//! let permission = breaker.permit().expect("closed breaker admits calls");
//! breaker.record_outcome(permission, &AttemptOutcome::timeout(1, Duration::from_millis(5)));
//!
//! assert_eq!(breaker.current_state().status, CircuitState::Open);
//! assert!(breaker.permit().is_err());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerConfig, WindowKind};
use crate::runtime::clock::{Clock, TokioClock};
use crate::runtime::events::AttemptOutcome;

/// Circuit breaker status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls fail immediately.
    Open,
    /// Circuit is half-open, a single probe tests recovery.
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by the metrics exporter (0=closed, 1=half-open, 2=open).
    #[must_use]
    pub fn as_gauge(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => f.write_str("closed"),
            CircuitState::Open => f.write_str("open"),
            CircuitState::HalfOpen => f.write_str("half_open"),
        }
    }
}

/// Point-in-time copy of a breaker's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerState {
    pub status: CircuitState,
    pub consecutive_failures: u32,
    pub window_failure_count: u32,
    pub window_start: Option<Instant>,
    pub last_transition_at: Instant,
    pub half_open_probe_in_flight: bool,
    /// Probe successes observed since entering half-open.
    pub half_open_successes: u32,
    /// Incremented on every transition.
    pub generation: u64,
}

/// Returned by [`CircuitBreaker::permit`] when a call must not be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpen {
    /// Time left until a probe may be admitted, when known.
    pub retry_after: Option<Duration>,
}

struct Core {
    status: CircuitState,
    consecutive_failures: u32,
    /// Failure timestamps for the sliding window.
    failures: VecDeque<Instant>,
    /// Failure count for the fixed window.
    fixed_count: u32,
    window_start: Option<Instant>,
    last_transition_at: Instant,
    half_open_successes: u32,
    generation: u64,
}

impl Core {
    fn window_failure_count(&self, kind: WindowKind) -> u32 {
        match kind {
            WindowKind::Sliding => u32::try_from(self.failures.len()).unwrap_or(u32::MAX),
            WindowKind::Fixed => self.fixed_count,
        }
    }

    /// Failures still inside the window at `now`, and where that window
    /// starts. Reads only; aged-out entries stay until the next failure.
    fn live_window(
        &self,
        now: Instant,
        kind: WindowKind,
        window: Duration,
    ) -> (u32, Option<Instant>) {
        let live = |at: &Instant| now.saturating_duration_since(*at) < window;
        match kind {
            WindowKind::Sliding => {
                let fresh = self.failures.iter().filter(|at| live(*at));
                let start = fresh.clone().next().copied();
                (u32::try_from(fresh.count()).unwrap_or(u32::MAX), start)
            }
            WindowKind::Fixed => match self.window_start {
                Some(start) if live(&start) => (self.fixed_count, Some(start)),
                _ => (0, None),
            },
        }
    }

    fn register_failure(&mut self, now: Instant, kind: WindowKind, window: Duration) -> u32 {
        match kind {
            WindowKind::Sliding => {
                self.failures.push_back(now);
                while let Some(oldest) = self.failures.front() {
                    if now.duration_since(*oldest) >= window {
                        self.failures.pop_front();
                    } else {
                        break;
                    }
                }
                self.window_start = self.failures.front().copied();
            }
            WindowKind::Fixed => {
                let expired = self
                    .window_start
                    .map_or(true, |start| now.duration_since(start) >= window);
                if expired {
                    self.window_start = Some(now);
                    self.fixed_count = 0;
                }
                self.fixed_count += 1;
            }
        }
        self.window_failure_count(kind)
    }
}

struct Shared {
    operation: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    core: Mutex<Core>,
    probe_in_flight: AtomicBool,
    total_permits: AtomicU64,
    total_rejections: AtomicU64,
    total_failures: AtomicU64,
}

impl Shared {
    fn transition(&self, core: &mut Core, to: CircuitState, now: Instant) {
        let from = core.status;
        core.status = to;
        core.last_transition_at = now;
        core.generation += 1;
        core.consecutive_failures = 0;
        core.failures.clear();
        core.fixed_count = 0;
        core.window_start = None;
        core.half_open_successes = 0;
        self.probe_in_flight.store(false, Ordering::Release);

        match to {
            CircuitState::Open => warn!(
                target: "resilience_engine::breaker",
                operation = %self.operation,
                %from,
                open_for = ?self.config.open_duration,
                "circuit opened"
            ),
            _ => info!(
                target: "resilience_engine::breaker",
                operation = %self.operation,
                %from,
                to = %to,
                "circuit state changed"
            ),
        }
    }
}

/// Permission to attempt one call, handed out by [`CircuitBreaker::permit`].
///
/// Hand it back through [`CircuitBreaker::record_outcome`]. A half-open probe
/// permission that is dropped unrecorded (caller cancelled, deadline passed)
/// frees the probe slot without affecting the breaker state.
#[must_use = "a permission must be returned via record_outcome"]
pub struct Permission {
    shared: Arc<Shared>,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl Permission {
    /// Returns `true` if this is the single half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl fmt::Debug for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permission")
            .field("operation", &self.shared.operation)
            .field("generation", &self.generation)
            .field("probe", &self.probe)
            .finish()
    }
}

impl Drop for Permission {
    fn drop(&mut self) {
        if self.settled || !self.probe {
            return;
        }
        let core = self.shared.core.lock().expect("lock poisoned");
        if core.generation == self.generation {
            self.shared.probe_in_flight.store(false, Ordering::Release);
            debug!(
                target: "resilience_engine::breaker",
                operation = %self.shared.operation,
                "half-open probe abandoned"
            );
        }
    }
}

/// Circuit breaker for one operation.
///
/// Cloning is cheap and yields a handle to the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation", &self.shared.operation)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a breaker that reads time from the tokio clock.
    pub fn new(operation: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(operation, config, Arc::new(TokioClock))
    }

    /// Create a breaker with an explicit clock.
    pub fn with_clock(
        operation: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            shared: Arc::new(Shared {
                operation: operation.into(),
                config,
                clock,
                core: Mutex::new(Core {
                    status: CircuitState::Closed,
                    consecutive_failures: 0,
                    failures: VecDeque::new(),
                    fixed_count: 0,
                    window_start: None,
                    last_transition_at: now,
                    half_open_successes: 0,
                    generation: 0,
                }),
                probe_in_flight: AtomicBool::new(false),
                total_permits: AtomicU64::new(0),
                total_rejections: AtomicU64::new(0),
                total_failures: AtomicU64::new(0),
            }),
        }
    }

    /// The protected operation's name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.shared.operation
    }

    /// Ask whether a call may be attempted now.
    ///
    /// # Errors
    ///
    /// Returns [`CircuitOpen`] while the circuit is open, or while half-open
    /// with a probe already in flight.
    pub fn permit(&self) -> std::result::Result<Permission, CircuitOpen> {
        let shared = &self.shared;
        let mut core = shared.core.lock().expect("lock poisoned");
        let now = shared.clock.now();

        if core.status == CircuitState::Open {
            let elapsed = now.duration_since(core.last_transition_at);
            if elapsed >= shared.config.open_duration {
                shared.transition(&mut core, CircuitState::HalfOpen, now);
            } else {
                shared.total_rejections.fetch_add(1, Ordering::Relaxed);
                return Err(CircuitOpen {
                    retry_after: Some(shared.config.open_duration - elapsed),
                });
            }
        }

        // Single-slot gate: only one probe while half-open.
        let probe = core.status == CircuitState::HalfOpen;
        if probe
            && shared
                .probe_in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            shared.total_rejections.fetch_add(1, Ordering::Relaxed);
            return Err(CircuitOpen { retry_after: None });
        }

        shared.total_permits.fetch_add(1, Ordering::Relaxed);
        Ok(Permission {
            shared: Arc::clone(shared),
            generation: core.generation,
            probe,
            settled: false,
        })
    }

    /// Feed the outcome of an attempted call back into the state machine.
    ///
    /// Returns the status after the outcome was applied. Outcomes for
    /// permissions granted before the latest transition are ignored.
    pub fn record_outcome(
        &self,
        mut permission: Permission,
        outcome: &AttemptOutcome,
    ) -> CircuitState {
        let shared = &self.shared;
        let mut core = shared.core.lock().expect("lock poisoned");
        permission.settled = true;

        if permission.generation != core.generation {
            debug!(
                target: "resilience_engine::breaker",
                operation = %shared.operation,
                attempt = outcome.attempt_index,
                "ignoring outcome from an earlier breaker generation"
            );
            return core.status;
        }

        let now = shared.clock.now();
        if !outcome.succeeded {
            shared.total_failures.fetch_add(1, Ordering::Relaxed);
        }

        match core.status {
            CircuitState::Closed => {
                if outcome.succeeded {
                    core.consecutive_failures = 0;
                } else {
                    core.consecutive_failures += 1;
                    let cb = &shared.config;
                    let count = core.register_failure(now, cb.window, cb.window_size);
                    if count >= cb.failure_threshold {
                        shared.transition(&mut core, CircuitState::Open, now);
                    }
                }
            }
            CircuitState::HalfOpen => {
                if permission.probe {
                    shared.probe_in_flight.store(false, Ordering::Release);
                }
                if outcome.succeeded {
                    core.half_open_successes += 1;
                    if core.half_open_successes >= shared.config.success_threshold {
                        shared.transition(&mut core, CircuitState::Closed, now);
                    }
                } else {
                    shared.transition(&mut core, CircuitState::Open, now);
                }
            }
            CircuitState::Open => {}
        }

        core.status
    }

    /// Side-effect free snapshot of the stored state.
    ///
    /// Does not apply the lazy `Open -> HalfOpen` transition.
    #[must_use]
    pub fn current_state(&self) -> BreakerState {
        let core = self.shared.core.lock().expect("lock poisoned");
        let cb = &self.shared.config;
        let (window_failure_count, window_start) =
            core.live_window(self.shared.clock.now(), cb.window, cb.window_size);
        BreakerState {
            status: core.status,
            consecutive_failures: core.consecutive_failures,
            window_failure_count,
            window_start,
            last_transition_at: core.last_transition_at,
            half_open_probe_in_flight: self.shared.probe_in_flight.load(Ordering::Acquire),
            half_open_successes: core.half_open_successes,
            generation: core.generation,
        }
    }

    /// Time left before an open circuit admits a probe.
    #[must_use]
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let core = self.shared.core.lock().expect("lock poisoned");
        if core.status != CircuitState::Open {
            return None;
        }
        let elapsed = self.shared.clock.now().duration_since(core.last_transition_at);
        Some(self.shared.config.open_duration.saturating_sub(elapsed))
    }

    /// Manually reset the breaker to closed.
    pub fn reset(&self) {
        let shared = &self.shared;
        let mut core = shared.core.lock().expect("lock poisoned");
        let now = shared.clock.now();
        shared.transition(&mut core, CircuitState::Closed, now);
    }

    /// Permissions granted.
    #[must_use]
    pub fn total_permits(&self) -> u64 {
        self.shared.total_permits.load(Ordering::Relaxed)
    }

    /// Calls rejected without being attempted.
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.shared.total_rejections.load(Ordering::Relaxed)
    }

    /// Failed outcomes recorded.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.shared.total_failures.load(Ordering::Relaxed)
    }

    /// The breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.shared.config
    }
}
