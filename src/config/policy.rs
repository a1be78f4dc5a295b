// SPDX-License-Identifier: MIT OR Apache-2.0

//! Policy definitions and the YAML policy file.
//!
//! Durations are written as integer milliseconds in `_ms` fields:
//!
//! ```yaml
//! policies:
//!   - operation: orders-db
//!     circuit_breaker:
//!       failure_threshold: 5
//!       success_threshold: 1
//!       open_duration_ms: 30000
//!       window_size_ms: 30000
//!       window: sliding
//!     retry:
//!       max_attempts: 3
//!       base_delay_ms: 100
//!       max_delay_ms: 2000
//!       jitter_fraction: 1.0
//!       retryable: default
//!     timeout:
//!       per_attempt_ms: 1500
//!     bulkhead:
//!       max_concurrent: 16
//!       max_queue_depth: 32
//!       queue_timeout_ms: 50
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{ResilienceError, Result};

/// Environment variable naming the policy file read by [`PolicyFile::load_from_env`].
pub const ENV_POLICY_FILE: &str = "RESILIENCE_POLICY_FILE";

/// Name of the retry predicate used when a policy names none.
pub const DEFAULT_PREDICATE: &str = "default";

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// How the breaker counts failures over `window_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    /// Failures older than `window_size` age out individually.
    #[default]
    Sliding,
    /// The count resets every `window_size`, starting at the first failure.
    Fixed,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open probe successes that close the circuit.
    pub success_threshold: u32,
    /// Time spent open before a probe is allowed.
    #[serde(rename = "open_duration_ms", with = "millis")]
    pub open_duration: Duration,
    /// Failure counting window.
    #[serde(rename = "window_size_ms", with = "millis")]
    pub window_size: Duration,
    /// Sliding or fixed window.
    pub window: WindowKind,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_duration: Duration::from_secs(30),
            window_size: Duration::from_secs(60),
            window: WindowKind::Sliding,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold for recovery.
    #[must_use]
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub fn with_open_duration(mut self, duration: Duration) -> Self {
        self.open_duration = duration;
        self
    }

    /// Set the failure counting window.
    #[must_use]
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size = window;
        self
    }

    /// Choose sliding or fixed windowing.
    #[must_use]
    pub fn with_window(mut self, kind: WindowKind) -> Self {
        self.window = kind;
        self
    }
}

/// Retry schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Upper bound on attempts, including the first.
    pub max_attempts: u32,
    /// Delay cap before the second attempt.
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    /// Ceiling for the exponential delay.
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    /// Share of the delay that is randomised; `1.0` is full jitter.
    pub jitter_fraction: f64,
    /// Name of the registered retry predicate.
    pub retryable: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter_fraction: 1.0,
            retryable: DEFAULT_PREDICATE.to_string(),
        }
    }
}

impl RetryConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the base delay.
    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay ceiling.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter fraction.
    #[must_use]
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Reference a registered retry predicate by name.
    #[must_use]
    pub fn with_retryable(mut self, predicate: impl Into<String>) -> Self {
        self.retryable = predicate.into();
        self
    }
}

/// Per-attempt time bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    #[serde(rename = "per_attempt_ms", with = "millis")]
    pub per_attempt: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            per_attempt: Duration::from_secs(10),
        }
    }
}

impl TimeoutConfig {
    /// Create a timeout configuration.
    #[must_use]
    pub fn new(per_attempt: Duration) -> Self {
        Self { per_attempt }
    }
}

/// Concurrency limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkheadConfig {
    /// Calls allowed in flight at once.
    pub max_concurrent: u32,
    /// Callers allowed to wait for a slot; `0` disables queuing.
    pub max_queue_depth: u32,
    /// Longest a queued caller waits.
    #[serde(rename = "queue_timeout_ms", with = "millis")]
    pub queue_timeout: Duration,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_depth: 0,
            queue_timeout: Duration::from_millis(100),
        }
    }
}

impl BulkheadConfig {
    /// Create a configuration with the given concurrency limit.
    #[must_use]
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            max_concurrent,
            ..Default::default()
        }
    }

    /// Set the queue depth.
    #[must_use]
    pub fn with_queue_depth(mut self, depth: u32) -> Self {
        self.max_queue_depth = depth;
        self
    }

    /// Set the queue timeout.
    #[must_use]
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }
}

/// Complete policy for one named operation. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub operation: String,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub bulkhead: BulkheadConfig,
}

impl PolicyConfig {
    /// Create a policy with default settings for `operation`.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            timeout: TimeoutConfig::default(),
            bulkhead: BulkheadConfig::default(),
        }
    }

    /// Replace the circuit breaker settings.
    #[must_use]
    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Replace the retry settings.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Replace the timeout settings.
    #[must_use]
    pub fn with_timeout(mut self, config: TimeoutConfig) -> Self {
        self.timeout = config;
        self
    }

    /// Replace the bulkhead settings.
    #[must_use]
    pub fn with_bulkhead(mut self, config: BulkheadConfig) -> Self {
        self.bulkhead = config;
        self
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::InvalidPolicy` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(ResilienceError::InvalidPolicy {
                operation: self.operation.clone(),
                reason: reason.to_string(),
            })
        };

        if self.operation.trim().is_empty() {
            return invalid("operation name must not be empty");
        }

        let cb = &self.circuit_breaker;
        if cb.failure_threshold == 0 {
            return invalid("failure_threshold must be greater than 0");
        }
        if cb.success_threshold == 0 {
            return invalid("success_threshold must be greater than 0");
        }
        if cb.window_size.is_zero() {
            return invalid("window_size must be greater than 0");
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return invalid("max_attempts must be at least 1");
        }
        if retry.max_delay < retry.base_delay {
            return invalid("max_delay must not be less than base_delay");
        }
        if !(0.0..=1.0).contains(&retry.jitter_fraction) {
            return invalid("jitter_fraction must be within [0, 1]");
        }
        if retry.retryable.trim().is_empty() {
            return invalid("retryable predicate name must not be empty");
        }

        if self.timeout.per_attempt.is_zero() {
            return invalid("per_attempt timeout must be greater than 0");
        }

        if self.bulkhead.max_concurrent == 0 {
            return invalid("max_concurrent must be greater than 0");
        }

        Ok(())
    }
}

/// The on-disk policy document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyFile {
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl PolicyFile {
    /// Parse a policy document from YAML.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if the YAML is malformed.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ResilienceError::Config(format!("Failed to parse policy YAML: {}", e)))
    }

    /// Serialize back to YAML.
    ///
    /// # Errors
    ///
    /// Returns `ResilienceError::Config` if serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| ResilienceError::Config(format!("Failed to write policy YAML: {}", e)))
    }

    /// Load a policy document from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is malformed.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ResilienceError::Config(format!(
                "Failed to read policy file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        Self::from_yaml(&content)
    }

    /// Load the file named by `RESILIENCE_POLICY_FILE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset or the file cannot be loaded.
    pub fn load_from_env() -> Result<Self> {
        let path = std::env::var(ENV_POLICY_FILE)
            .map_err(|_| ResilienceError::Config(format!("{} is not set", ENV_POLICY_FILE)))?;
        Self::load_from_path(path)
    }

    /// Look up a policy by operation name.
    pub fn get(&self, operation: &str) -> Option<&PolicyConfig> {
        self.policies.iter().find(|p| p.operation == operation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
policies:
  - operation: orders-db
    circuit_breaker:
      failure_threshold: 5
      success_threshold: 2
      open_duration_ms: 30000
      window_size_ms: 10000
      window: fixed
    retry:
      max_attempts: 4
      base_delay_ms: 50
      max_delay_ms: 800
      jitter_fraction: 0.5
      retryable: default
    timeout:
      per_attempt_ms: 1500
    bulkhead:
      max_concurrent: 8
      max_queue_depth: 4
      queue_timeout_ms: 25
  - operation: session-cache
"#;

    #[test]
    fn test_parse_full_policy() {
        let file = PolicyFile::from_yaml(SAMPLE).unwrap();
        assert_eq!(file.policies.len(), 2);

        let db = file.get("orders-db").unwrap();
        assert_eq!(db.circuit_breaker.failure_threshold, 5);
        assert_eq!(db.circuit_breaker.success_threshold, 2);
        assert_eq!(db.circuit_breaker.open_duration, Duration::from_secs(30));
        assert_eq!(db.circuit_breaker.window_size, Duration::from_secs(10));
        assert_eq!(db.circuit_breaker.window, WindowKind::Fixed);
        assert_eq!(db.retry.max_attempts, 4);
        assert_eq!(db.retry.base_delay, Duration::from_millis(50));
        assert_eq!(db.retry.max_delay, Duration::from_millis(800));
        assert!((db.retry.jitter_fraction - 0.5).abs() < f64::EPSILON);
        assert_eq!(db.timeout.per_attempt, Duration::from_millis(1500));
        assert_eq!(db.bulkhead.max_concurrent, 8);
        assert_eq!(db.bulkhead.max_queue_depth, 4);
        assert_eq!(db.bulkhead.queue_timeout, Duration::from_millis(25));
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let file = PolicyFile::from_yaml(SAMPLE).unwrap();
        let cache = file.get("session-cache").unwrap();

        assert_eq!(cache.circuit_breaker, CircuitBreakerConfig::default());
        assert_eq!(cache.retry, RetryConfig::default());
        assert_eq!(cache.timeout, TimeoutConfig::default());
        assert_eq!(cache.bulkhead, BulkheadConfig::default());
    }

    #[test]
    fn test_yaml_round_trip() {
        let file = PolicyFile::from_yaml(SAMPLE).unwrap();
        let yaml = file.to_yaml().unwrap();
        let reparsed = PolicyFile::from_yaml(&yaml).unwrap();
        assert_eq!(file, reparsed);
    }

    #[test]
    fn test_malformed_yaml() {
        let err = PolicyFile::from_yaml("policies: [ { operation: 3, retry: nope } ]").unwrap_err();
        assert!(matches!(err, ResilienceError::Config(_)));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policies.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        let file = PolicyFile::load_from_path(&path).unwrap();
        assert_eq!(file.policies.len(), 2);

        let missing = PolicyFile::load_from_path(dir.path().join("missing.yaml"));
        assert!(matches!(missing, Err(ResilienceError::Config(_))));
    }

    #[test]
    fn test_validate_defaults_ok() {
        assert!(PolicyConfig::new("ok").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases = vec![
            PolicyConfig::new("a")
                .with_circuit_breaker(CircuitBreakerConfig::new().with_failure_threshold(0)),
            PolicyConfig::new("b")
                .with_circuit_breaker(CircuitBreakerConfig::new().with_success_threshold(0)),
            PolicyConfig::new("c").with_retry(RetryConfig::new().with_max_attempts(0)),
            PolicyConfig::new("d").with_retry(
                RetryConfig::new()
                    .with_base_delay(Duration::from_secs(2))
                    .with_max_delay(Duration::from_secs(1)),
            ),
            PolicyConfig::new("e").with_retry(RetryConfig::new().with_jitter_fraction(1.5)),
            PolicyConfig::new("f").with_timeout(TimeoutConfig::new(Duration::ZERO)),
            PolicyConfig::new("g").with_bulkhead(BulkheadConfig::new(0)),
            PolicyConfig::new(" "),
        ];

        for policy in cases {
            let err = policy.validate().unwrap_err();
            assert!(
                matches!(err, ResilienceError::InvalidPolicy { .. }),
                "expected InvalidPolicy for {}",
                policy.operation
            );
        }
    }
}
