// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured logging of attempt outcomes and rejections.
//!
//! [`LogSink`] is an [`OutcomeSink`] that writes one `tracing` event per
//! attempt and per rejection under the `resilience_engine::outcome` target.
//!
//! # Example
//!
//! ```
//! use resilience_engine::runtime::{LogLevel, LogSink, LoggingConfig};
//!
//! let sink = LogSink::with_config(
//!     LoggingConfig::new()
//!         .with_success_level(LogLevel::Debug)
//!         .with_failure_level(LogLevel::Warn),
//! );
//! assert_eq!(sink.config().success_level, LogLevel::Debug);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, trace, warn};

use crate::runtime::events::{OutcomeEvent, OutcomeSink, RejectionEvent};

/// Log level for the outcome logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Trace level - most verbose.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level - only errors.
    Error,
    /// Disabled - no logging.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Off => write!(f, "OFF"),
        }
    }
}

/// Levels used by [`LogSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level for successful attempts.
    pub success_level: LogLevel,
    /// Level for failed or timed-out attempts.
    pub failure_level: LogLevel,
    /// Level for breaker and bulkhead rejections.
    pub rejection_level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            success_level: LogLevel::Debug,
            failure_level: LogLevel::Warn,
            rejection_level: LogLevel::Info,
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success log level.
    #[must_use]
    pub fn with_success_level(mut self, level: LogLevel) -> Self {
        self.success_level = level;
        self
    }

    /// Set the failure log level.
    #[must_use]
    pub fn with_failure_level(mut self, level: LogLevel) -> Self {
        self.failure_level = level;
        self
    }

    /// Set the rejection log level.
    #[must_use]
    pub fn with_rejection_level(mut self, level: LogLevel) -> Self {
        self.rejection_level = level;
        self
    }

    /// Log everything, successes at debug.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            success_level: LogLevel::Debug,
            failure_level: LogLevel::Info,
            rejection_level: LogLevel::Info,
        }
    }

    /// Only failures and rejections, at warn.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            success_level: LogLevel::Off,
            failure_level: LogLevel::Warn,
            rejection_level: LogLevel::Warn,
        }
    }
}

macro_rules! log_at {
    ($level:expr, $($arg:tt)+) => {
        match $level {
            LogLevel::Trace => trace!(target: "resilience_engine::outcome", $($arg)+),
            LogLevel::Debug => debug!(target: "resilience_engine::outcome", $($arg)+),
            LogLevel::Info => info!(target: "resilience_engine::outcome", $($arg)+),
            LogLevel::Warn => warn!(target: "resilience_engine::outcome", $($arg)+),
            LogLevel::Error => error!(target: "resilience_engine::outcome", $($arg)+),
            LogLevel::Off => {}
        }
    };
}

/// Outcome sink that logs through `tracing`.
#[derive(Debug, Default)]
pub struct LogSink {
    config: LoggingConfig,
    logged_attempts: AtomicU64,
    logged_rejections: AtomicU64,
}

impl LogSink {
    /// Create a sink with default levels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink with custom levels.
    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Attempt events seen.
    #[must_use]
    pub fn logged_attempts(&self) -> u64 {
        self.logged_attempts.load(Ordering::Relaxed)
    }

    /// Rejection events seen.
    #[must_use]
    pub fn logged_rejections(&self) -> u64 {
        self.logged_rejections.load(Ordering::Relaxed)
    }
}

impl OutcomeSink for LogSink {
    fn on_attempt(&self, event: &OutcomeEvent) {
        self.logged_attempts.fetch_add(1, Ordering::Relaxed);
        let level = if event.outcome.succeeded {
            self.config.success_level
        } else {
            self.config.failure_level
        };
        log_at!(
            level,
            operation = %event.operation,
            attempt = event.attempt_index,
            outcome = event.outcome.label(),
            breaker = %event.breaker_state_after,
            duration_ms = u64::try_from(event.elapsed.as_millis()).unwrap_or(u64::MAX),
            "attempt finished"
        );
    }

    fn on_rejection(&self, event: &RejectionEvent) {
        self.logged_rejections.fetch_add(1, Ordering::Relaxed);
        log_at!(
            self.config.rejection_level,
            operation = %event.operation,
            reason = %event.source,
            attempts = event.attempts,
            "call rejected"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RejectReason;
    use crate::runtime::circuit_breaker::CircuitState;
    use crate::runtime::events::{AttemptOutcome, RejectionSource};
    use std::time::Duration;

    #[test]
    fn test_log_level_display() {
        assert_eq!(LogLevel::Trace.to_string(), "TRACE");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert_eq!(LogLevel::Off.to_string(), "OFF");
    }

    #[test]
    fn test_logging_config_presets() {
        let quiet = LoggingConfig::quiet();
        assert_eq!(quiet.success_level, LogLevel::Off);
        assert_eq!(quiet.failure_level, LogLevel::Warn);

        let verbose = LoggingConfig::verbose();
        assert_eq!(verbose.success_level, LogLevel::Debug);
        assert_eq!(verbose.failure_level, LogLevel::Info);
    }

    #[test]
    fn test_log_sink_counts_events() {
        let sink = LogSink::with_config(LoggingConfig::quiet());
        sink.on_attempt(&OutcomeEvent {
            operation: "billing".to_string(),
            attempt_index: 1,
            outcome: AttemptOutcome::success(1, Duration::from_millis(2)),
            breaker_state_after: CircuitState::Closed,
            elapsed: Duration::from_millis(2),
        });
        sink.on_rejection(&RejectionEvent {
            operation: "billing".to_string(),
            source: RejectionSource::Bulkhead(RejectReason::QueueFull),
            attempts: 0,
        });

        assert_eq!(sink.logged_attempts(), 1);
        assert_eq!(sink.logged_rejections(), 1);
    }

    #[test]
    fn test_log_sink_under_subscriber() {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_test_writer()
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            let sink = LogSink::with_config(LoggingConfig::verbose());
            sink.on_attempt(&OutcomeEvent {
                operation: "billing".to_string(),
                attempt_index: 2,
                outcome: AttemptOutcome::timeout(2, Duration::from_millis(50)),
                breaker_state_after: CircuitState::Open,
                elapsed: Duration::from_millis(50),
            });
            assert_eq!(sink.logged_attempts(), 1);
        });
    }
}
