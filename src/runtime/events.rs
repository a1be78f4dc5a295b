// SPDX-License-Identifier: MIT OR Apache-2.0

//! Attempt outcomes and the observability hook.
//!
//! After every attempt the engine emits an [`OutcomeEvent`] to the configured
//! [`OutcomeSink`]; calls turned away before any attempt emit a
//! [`RejectionEvent`]. How events are exported is up to the sink.
//!
//! # Example
//!
//! ```
//! use resilience_engine::runtime::BroadcastSink;
//!
//! let sink = BroadcastSink::new(64);
//! let _events = sink.subscribe();
//! // pass `sink` to the orchestrator builder, then poll `_events`
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::error::{ErrorKind, RejectReason};
use crate::runtime::circuit_breaker::CircuitState;

/// Result of one attempt, as seen by the breaker and the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub succeeded: bool,
    /// `None` on success; `Transient`, `Permanent` or `Timeout` otherwise.
    pub error_kind: Option<ErrorKind>,
    pub elapsed: Duration,
    /// 1-based.
    pub attempt_index: u32,
}

impl AttemptOutcome {
    /// A successful attempt.
    #[must_use]
    pub fn success(attempt_index: u32, elapsed: Duration) -> Self {
        Self {
            succeeded: true,
            error_kind: None,
            elapsed,
            attempt_index,
        }
    }

    /// A failed attempt.
    #[must_use]
    pub fn failure(attempt_index: u32, kind: ErrorKind, elapsed: Duration) -> Self {
        Self {
            succeeded: false,
            error_kind: Some(kind),
            elapsed,
            attempt_index,
        }
    }

    /// An attempt cut off by its per-attempt timeout.
    #[must_use]
    pub fn timeout(attempt_index: u32, elapsed: Duration) -> Self {
        Self::failure(attempt_index, ErrorKind::Timeout, elapsed)
    }

    /// Short label used in logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.error_kind {
            None => "success",
            Some(ErrorKind::Timeout) => "timeout",
            Some(ErrorKind::Permanent) => "permanent",
            Some(_) => "transient",
        }
    }
}

/// Emitted after every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeEvent {
    pub operation: String,
    pub attempt_index: u32,
    pub outcome: AttemptOutcome,
    pub breaker_state_after: CircuitState,
    pub elapsed: Duration,
}

/// Which gate turned a call away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectionSource {
    CircuitBreaker,
    Bulkhead(RejectReason),
}

impl fmt::Display for RejectionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionSource::CircuitBreaker => f.write_str("circuit_open"),
            RejectionSource::Bulkhead(reason) => write!(f, "bulkhead_{reason}"),
        }
    }
}

/// Emitted when a call, or a retry of it, is rejected before being attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectionEvent {
    pub operation: String,
    pub source: RejectionSource,
    /// Attempts already made for this call.
    pub attempts: u32,
}

/// Consumer of engine events.
///
/// Implementations must be cheap and must not block; they run inline on the
/// calling task.
pub trait OutcomeSink: Send + Sync + 'static {
    /// Called after every attempt.
    fn on_attempt(&self, event: &OutcomeEvent);

    /// Called when a gate rejects a call.
    fn on_rejection(&self, _event: &RejectionEvent) {}
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl OutcomeSink for NullSink {
    fn on_attempt(&self, _event: &OutcomeEvent) {}
}

/// Forwards events to several sinks in order.
#[derive(Clone, Default)]
pub struct MulticastSink {
    sinks: Vec<Arc<dyn OutcomeSink>>,
}

impl MulticastSink {
    /// Create an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of attached sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Returns `true` if no sinks are attached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl fmt::Debug for MulticastSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MulticastSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl OutcomeSink for MulticastSink {
    fn on_attempt(&self, event: &OutcomeEvent) {
        for sink in &self.sinks {
            sink.on_attempt(event);
        }
    }

    fn on_rejection(&self, event: &RejectionEvent) {
        for sink in &self.sinks {
            sink.on_rejection(event);
        }
    }
}

/// Event published on a [`BroadcastSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Attempt(OutcomeEvent),
    Rejected(RejectionEvent),
}

/// Publishes events to any number of stream subscribers.
///
/// Slow subscribers that fall more than `capacity` events behind skip the
/// events they missed.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> impl tokio_stream::Stream<Item = EngineEvent> + Send + Unpin {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|event| event.ok())
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn publish(&self, event: EngineEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl OutcomeSink for BroadcastSink {
    fn on_attempt(&self, event: &OutcomeEvent) {
        self.publish(EngineEvent::Attempt(event.clone()));
    }

    fn on_rejection(&self, event: &RejectionEvent) {
        self.publish(EngineEvent::Rejected(event.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        attempts: Mutex<Vec<OutcomeEvent>>,
        rejections: Mutex<Vec<RejectionEvent>>,
    }

    impl OutcomeSink for Recording {
        fn on_attempt(&self, event: &OutcomeEvent) {
            self.attempts.lock().unwrap().push(event.clone());
        }

        fn on_rejection(&self, event: &RejectionEvent) {
            self.rejections.lock().unwrap().push(event.clone());
        }
    }

    fn event(attempt: u32) -> OutcomeEvent {
        OutcomeEvent {
            operation: "payments".to_string(),
            attempt_index: attempt,
            outcome: AttemptOutcome::success(attempt, Duration::from_millis(3)),
            breaker_state_after: CircuitState::Closed,
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(AttemptOutcome::success(1, Duration::ZERO).label(), "success");
        assert_eq!(AttemptOutcome::timeout(1, Duration::ZERO).label(), "timeout");
        assert_eq!(
            AttemptOutcome::failure(2, ErrorKind::Permanent, Duration::ZERO).label(),
            "permanent"
        );
        assert_eq!(
            AttemptOutcome::failure(2, ErrorKind::Transient, Duration::ZERO).label(),
            "transient"
        );
    }

    #[test]
    fn test_multicast_fans_out() {
        let a = Arc::new(Recording::default());
        let b = Arc::new(Recording::default());
        let sink = MulticastSink::new()
            .with_sink(a.clone())
            .with_sink(b.clone())
            .with_sink(Arc::new(NullSink));
        assert_eq!(sink.len(), 3);

        sink.on_attempt(&event(1));
        sink.on_rejection(&RejectionEvent {
            operation: "payments".to_string(),
            source: RejectionSource::Bulkhead(RejectReason::QueueFull),
            attempts: 0,
        });

        assert_eq!(a.attempts.lock().unwrap().len(), 1);
        assert_eq!(b.attempts.lock().unwrap().len(), 1);
        assert_eq!(b.rejections.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_stream_delivers_in_order() {
        let sink = BroadcastSink::new(8);
        let mut stream = sink.subscribe();
        assert_eq!(sink.subscriber_count(), 1);

        sink.on_attempt(&event(1));
        sink.on_attempt(&event(2));

        match stream.next().await {
            Some(EngineEvent::Attempt(e)) => assert_eq!(e.attempt_index, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next().await {
            Some(EngineEvent::Attempt(e)) => assert_eq!(e.attempt_index, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_broadcast_without_subscribers() {
        let sink = BroadcastSink::default();
        sink.on_attempt(&event(1));
        assert_eq!(sink.subscriber_count(), 0);
    }

    #[test]
    fn test_rejection_source_display() {
        assert_eq!(RejectionSource::CircuitBreaker.to_string(), "circuit_open");
        assert_eq!(
            RejectionSource::Bulkhead(RejectReason::QueueTimeout).to_string(),
            "bulkhead_queue_timeout"
        );
    }
}
