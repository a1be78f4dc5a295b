// SPDX-License-Identifier: MIT OR Apache-2.0

//! Prometheus-compatible metrics for protected operations.
//!
//! [`MetricsCollector`] is an [`OutcomeSink`]: attach it to the orchestrator
//! and it keeps per-operation counters that can be scraped as Prometheus text.
//!
//! # Metrics
//!
//! - `attempts_total{operation, outcome}`
//! - `attempt_duration_seconds{operation}` histogram
//! - `circuit_breaker_state{operation}` (0=closed, 1=half-open, 2=open)
//! - `rejections_total{operation, reason}`
//!
//! # Example
//!
//! ```rust
//! use resilience_engine::runtime::metrics::{MetricsCollector, MetricsConfig};
//! use std::time::Duration;
//!
//! let metrics = MetricsCollector::new(MetricsConfig::builder().namespace("shop").build());
//! metrics.record_attempt("checkout", "success", Duration::from_millis(42));
//!
//! let output = metrics.to_prometheus_text();
//! assert!(output.contains("shop_attempts_total"));
//! ```

use std::collections::HashMap;
use std::fmt::Write as _;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::runtime::circuit_breaker::CircuitState;
use crate::runtime::events::{OutcomeEvent, OutcomeSink, RejectionEvent};

/// Configuration for the metrics collector.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Metric namespace prefix (e.g., "shop" -> "shop_attempts_total")
    pub namespace: String,
    /// Histogram buckets for attempt duration (in seconds)
    pub histogram_buckets: Vec<f64>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: "resilience".to_string(),
            histogram_buckets: vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        }
    }
}

impl MetricsConfig {
    /// Create a new builder for `MetricsConfig`.
    pub fn builder() -> MetricsConfigBuilder {
        MetricsConfigBuilder::default()
    }
}

/// Builder for `MetricsConfig`.
#[derive(Debug, Default)]
pub struct MetricsConfigBuilder {
    namespace: Option<String>,
    histogram_buckets: Option<Vec<f64>>,
}

impl MetricsConfigBuilder {
    /// Set the metric namespace prefix.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set histogram buckets for attempt duration (in seconds).
    pub fn histogram_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.histogram_buckets = Some(buckets);
        self
    }

    /// Build the `MetricsConfig`.
    pub fn build(self) -> MetricsConfig {
        let default = MetricsConfig::default();
        MetricsConfig {
            namespace: self.namespace.unwrap_or(default.namespace),
            histogram_buckets: self.histogram_buckets.unwrap_or(default.histogram_buckets),
        }
    }
}

/// Cumulative histogram.
#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new(buckets: Vec<f64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            sum_nanos: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn observe(&self, value: Duration) {
        let secs = value.as_secs_f64();
        // values above every bucket only land in +Inf
        for (bucket, count) in self.buckets.iter().zip(&self.counts) {
            if secs <= *bucket {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.sum_nanos.fetch_add(
            u64::try_from(value.as_nanos()).unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn sum_secs(&self) -> f64 {
        Duration::from_nanos(self.sum_nanos.load(Ordering::Relaxed)).as_secs_f64()
    }

    fn total_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

type CounterMap<K> = RwLock<HashMap<K, AtomicU64>>;

/// Increment a labelled counter, taking the write lock only for new labels.
fn bump<K: Eq + Hash>(map: &CounterMap<K>, key: K) {
    {
        let counters = map.read().expect("lock poisoned");
        if let Some(counter) = counters.get(&key) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
    }
    map.write()
        .expect("lock poisoned")
        .entry(key)
        .or_insert_with(|| AtomicU64::new(0))
        .fetch_add(1, Ordering::Relaxed);
}

fn sum_where<K>(map: &CounterMap<K>, pred: impl Fn(&K) -> bool) -> u64 {
    map.read()
        .expect("lock poisoned")
        .iter()
        .filter(|(k, _)| pred(k))
        .map(|(_, c)| c.load(Ordering::Relaxed))
        .sum()
}

/// Thread-safe per-operation metrics.
#[derive(Debug)]
pub struct MetricsCollector {
    config: MetricsConfig,
    /// Counter: attempts_total{operation, outcome}
    attempts_total: CounterMap<(String, &'static str)>,
    /// Histogram: attempt_duration_seconds{operation}
    attempt_duration: RwLock<HashMap<String, Histogram>>,
    /// Gauge: circuit_breaker_state{operation}
    breaker_state: RwLock<HashMap<String, AtomicU64>>,
    /// Counter: rejections_total{operation, reason}
    rejections_total: CounterMap<(String, String)>,
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            attempts_total: RwLock::new(HashMap::new()),
            attempt_duration: RwLock::new(HashMap::new()),
            breaker_state: RwLock::new(HashMap::new()),
            rejections_total: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
        }
    }

    /// Create a new metrics collector with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(MetricsConfig::default())
    }

    /// Record one attempt.
    pub fn record_attempt(&self, operation: &str, outcome: &'static str, duration: Duration) {
        bump(&self.attempts_total, (operation.to_string(), outcome));

        {
            let histograms = self.attempt_duration.read().expect("lock poisoned");
            if let Some(hist) = histograms.get(operation) {
                hist.observe(duration);
                return;
            }
        }
        let mut histograms = self.attempt_duration.write().expect("lock poisoned");
        histograms
            .entry(operation.to_string())
            .or_insert_with(|| Histogram::new(self.config.histogram_buckets.clone()))
            .observe(duration);
    }

    /// Update the breaker state gauge of `operation`.
    pub fn set_breaker_state(&self, operation: &str, state: CircuitState) {
        {
            let gauges = self.breaker_state.read().expect("lock poisoned");
            if let Some(gauge) = gauges.get(operation) {
                gauge.store(state.as_gauge(), Ordering::Relaxed);
                return;
            }
        }
        self.breaker_state
            .write()
            .expect("lock poisoned")
            .entry(operation.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .store(state.as_gauge(), Ordering::Relaxed);
    }

    /// Record a rejection.
    pub fn record_rejection(&self, operation: &str, reason: impl Into<String>) {
        bump(&self.rejections_total, (operation.to_string(), reason.into()));
    }

    /// Get the total number of attempts.
    pub fn total_attempts(&self) -> u64 {
        sum_where(&self.attempts_total, |_| true)
    }

    /// Get the number of successful attempts.
    pub fn successful_attempts(&self) -> u64 {
        sum_where(&self.attempts_total, |(_, outcome)| *outcome == "success")
    }

    /// Get the number of failed attempts, timeouts included.
    pub fn failed_attempts(&self) -> u64 {
        sum_where(&self.attempts_total, |(_, outcome)| *outcome != "success")
    }

    /// Attempts of one operation.
    pub fn attempts_for(&self, operation: &str) -> u64 {
        sum_where(&self.attempts_total, |(op, _)| op == operation)
    }

    /// Last reported breaker gauge of `operation`.
    pub fn breaker_state(&self, operation: &str) -> Option<u64> {
        self.breaker_state
            .read()
            .expect("lock poisoned")
            .get(operation)
            .map(|g| g.load(Ordering::Relaxed))
    }

    /// Get the total number of rejections.
    pub fn total_rejections(&self) -> u64 {
        sum_where(&self.rejections_total, |_| true)
    }

    /// Rejections of one operation.
    pub fn rejections_for(&self, operation: &str) -> u64 {
        sum_where(&self.rejections_total, |(op, _)| op == operation)
    }

    /// Get collector uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus_text(&self) -> String {
        let mut output = String::new();
        let ns = &self.config.namespace;

        // write! into a String cannot fail
        let _ = writeln!(output, "# HELP {ns}_attempts_total Total number of attempts");
        let _ = writeln!(output, "# TYPE {ns}_attempts_total counter");
        {
            let counters = self.attempts_total.read().expect("lock poisoned");
            for ((operation, outcome), count) in counters.iter() {
                let _ = writeln!(
                    output,
                    "{ns}_attempts_total{{operation=\"{operation}\",outcome=\"{outcome}\"}} {}",
                    count.load(Ordering::Relaxed)
                );
            }
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {ns}_attempt_duration_seconds Attempt duration in seconds"
        );
        let _ = writeln!(output, "# TYPE {ns}_attempt_duration_seconds histogram");
        {
            let histograms = self.attempt_duration.read().expect("lock poisoned");
            for (operation, hist) in histograms.iter() {
                let labels = format!("operation=\"{operation}\"");
                for (bucket, count) in hist.buckets.iter().zip(&hist.counts) {
                    let _ = writeln!(
                        output,
                        "{ns}_attempt_duration_seconds_bucket{{{labels},le=\"{bucket}\"}} {}",
                        count.load(Ordering::Relaxed)
                    );
                }
                let total = hist.total_count();
                let _ = writeln!(
                    output,
                    "{ns}_attempt_duration_seconds_bucket{{{labels},le=\"+Inf\"}} {total}"
                );
                let _ = writeln!(
                    output,
                    "{ns}_attempt_duration_seconds_sum{{{labels}}} {}",
                    hist.sum_secs()
                );
                let _ = writeln!(
                    output,
                    "{ns}_attempt_duration_seconds_count{{{labels}}} {total}"
                );
            }
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {ns}_circuit_breaker_state Circuit breaker state (0=closed, 1=half-open, 2=open)"
        );
        let _ = writeln!(output, "# TYPE {ns}_circuit_breaker_state gauge");
        {
            let gauges = self.breaker_state.read().expect("lock poisoned");
            for (operation, gauge) in gauges.iter() {
                let _ = writeln!(
                    output,
                    "{ns}_circuit_breaker_state{{operation=\"{operation}\"}} {}",
                    gauge.load(Ordering::Relaxed)
                );
            }
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {ns}_rejections_total Calls rejected without being attempted"
        );
        let _ = writeln!(output, "# TYPE {ns}_rejections_total counter");
        {
            let counters = self.rejections_total.read().expect("lock poisoned");
            for ((operation, reason), count) in counters.iter() {
                let _ = writeln!(
                    output,
                    "{ns}_rejections_total{{operation=\"{operation}\",reason=\"{reason}\"}} {}",
                    count.load(Ordering::Relaxed)
                );
            }
        }
        output.push('\n');

        let _ = writeln!(output, "# HELP {ns}_uptime_seconds Collector uptime in seconds");
        let _ = writeln!(output, "# TYPE {ns}_uptime_seconds gauge");
        let _ = writeln!(output, "{ns}_uptime_seconds {}", self.uptime().as_secs_f64());

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl OutcomeSink for MetricsCollector {
    fn on_attempt(&self, event: &OutcomeEvent) {
        self.record_attempt(&event.operation, event.outcome.label(), event.elapsed);
        self.set_breaker_state(&event.operation, event.breaker_state_after);
    }

    fn on_rejection(&self, event: &RejectionEvent) {
        self.record_rejection(&event.operation, event.source.to_string());
    }
}

/// Snapshot of current metrics for programmatic access.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Total attempts
    pub total_attempts: u64,
    /// Successful attempts
    pub successful_attempts: u64,
    /// Failed attempts
    pub failed_attempts: u64,
    /// Rejected calls
    pub total_rejections: u64,
    /// Collector uptime
    pub uptime: Duration,
}

impl MetricsCollector {
    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_attempts: self.total_attempts(),
            successful_attempts: self.successful_attempts(),
            failed_attempts: self.failed_attempts(),
            total_rejections: self.total_rejections(),
            uptime: self.uptime(),
        }
    }
}
