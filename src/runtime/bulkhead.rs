// SPDX-License-Identifier: MIT OR Apache-2.0

//! Concurrency bulkhead for one operation.
//!
//! A counting semaphore of `max_concurrent` slots plus a bounded wait queue of
//! `max_queue_depth`. Waiters are admitted in FIFO order. A slot is held by a
//! [`BulkheadTicket`] and released when the ticket drops, on every exit path.
//!
//! # Example
//!
//! ```
//! use resilience_engine::config::BulkheadConfig;
//! use resilience_engine::runtime::{Bulkhead, CallContext};
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bulkhead = Bulkhead::new("search", BulkheadConfig::new(2).with_queue_depth(4));
//! let ticket = bulkhead
//!     .acquire(Duration::from_millis(50), &CallContext::new())
//!     .await
//!     .expect("slot available");
//! assert_eq!(bulkhead.active_count(), 1);
//! ticket.release();
//! assert_eq!(bulkhead.active_count(), 0);
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::BulkheadConfig;
use crate::error::RejectReason;
use crate::runtime::context::{deadline_after, CallContext};

/// Why [`Bulkhead::acquire`] did not hand out a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// Capacity and queue exhausted, or the queue wait timed out.
    Rejected(RejectReason),
    /// The caller cancelled while queued.
    Cancelled,
    /// The caller's deadline passed while queued.
    DeadlineExceeded,
}

/// A held bulkhead slot. Dropping it releases the slot.
pub struct BulkheadTicket {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicU32>,
    waited: Duration,
}

impl BulkheadTicket {
    /// Release the slot now.
    pub fn release(self) {
        drop(self);
    }

    /// Time spent queued before admission.
    #[must_use]
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

impl fmt::Debug for BulkheadTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadTicket")
            .field("waited", &self.waited)
            .finish()
    }
}

impl Drop for BulkheadTicket {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Releases a reserved queue position on every exit path.
struct QueueSlot<'a>(&'a AtomicU32);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bulkhead for limiting concurrent calls to one operation.
pub struct Bulkhead {
    operation: String,
    config: BulkheadConfig,
    semaphore: Arc<Semaphore>,
    active: Arc<AtomicU32>,
    waiting: AtomicU32,
    total_admitted: AtomicU64,
    total_rejections: AtomicU64,
    total_timeouts: AtomicU64,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("operation", &self.operation)
            .field("config", &self.config)
            .field("active", &self.active_count())
            .field("waiting", &self.waiting_count())
            .finish()
    }
}

impl Bulkhead {
    /// Create a bulkhead.
    pub fn new(operation: impl Into<String>, config: BulkheadConfig) -> Self {
        let operation = operation.into();
        debug!(
            target: "resilience_engine::bulkhead",
            operation = %operation,
            max_concurrent = config.max_concurrent,
            max_queue_depth = config.max_queue_depth,
            "bulkhead initialized"
        );

        Self {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent as usize)),
            operation,
            config,
            active: Arc::new(AtomicU32::new(0)),
            waiting: AtomicU32::new(0),
            total_admitted: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
        }
    }

    /// The protected operation's name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Calls currently holding a slot.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        self.active.load(Ordering::SeqCst)
    }

    /// Callers currently queued.
    #[must_use]
    pub fn waiting_count(&self) -> u32 {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Free slots.
    #[must_use]
    pub fn available_permits(&self) -> u32 {
        u32::try_from(self.semaphore.available_permits()).unwrap_or(u32::MAX)
    }

    /// Acquire a slot, queuing for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AcquireError::Rejected`] when the queue is full or the wait
    /// times out, and `Cancelled`/`DeadlineExceeded` when the caller's context
    /// ends the wait first. The queue position is released in every case.
    pub async fn acquire(
        &self,
        timeout: Duration,
        ctx: &CallContext,
    ) -> std::result::Result<BulkheadTicket, AcquireError> {
        if ctx.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        let start = Instant::now();
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(self.admit(permit, Duration::ZERO));
        }

        let max_depth = self.config.max_queue_depth;
        let reserved = self
            .waiting
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |w| {
                (w < max_depth).then_some(w + 1)
            })
            .is_ok();
        if !reserved {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            debug!(
                target: "resilience_engine::bulkhead",
                operation = %self.operation,
                "bulkhead queue full, rejecting call"
            );
            return Err(AcquireError::Rejected(RejectReason::QueueFull));
        }
        let _queued = QueueSlot(&self.waiting);

        let (deadline, caller_bound) = ctx.bound(deadline_after(start, timeout));
        let acquired = tokio::select! {
            biased;
            _ = ctx.token().cancelled() => Err(AcquireError::Cancelled),
            res = tokio::time::timeout_at(deadline, Arc::clone(&self.semaphore).acquire_owned()) => {
                match res {
                    Ok(Ok(permit)) => Ok(permit),
                    // closed semaphore: never happens, treat as full
                    Ok(Err(_)) => Err(AcquireError::Rejected(RejectReason::QueueFull)),
                    Err(_) if caller_bound => Err(AcquireError::DeadlineExceeded),
                    Err(_) => Err(AcquireError::Rejected(RejectReason::QueueTimeout)),
                }
            }
        };

        match acquired {
            Ok(permit) => Ok(self.admit(permit, start.elapsed())),
            Err(e) => {
                if e == AcquireError::Rejected(RejectReason::QueueTimeout) {
                    self.total_timeouts.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        target: "resilience_engine::bulkhead",
                        operation = %self.operation,
                        queue_timeout = ?timeout,
                        "bulkhead timeout waiting for slot"
                    );
                }
                Err(e)
            }
        }
    }

    fn admit(&self, permit: OwnedSemaphorePermit, waited: Duration) -> BulkheadTicket {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        BulkheadTicket {
            _permit: permit,
            active: Arc::clone(&self.active),
            waited,
        }
    }

    /// Bulkhead statistics.
    #[must_use]
    pub fn stats(&self) -> BulkheadStats {
        BulkheadStats {
            operation: self.operation.clone(),
            max_concurrent: self.config.max_concurrent,
            max_queue_depth: self.config.max_queue_depth,
            active_count: self.active_count(),
            waiting_count: self.waiting_count(),
            available_permits: self.available_permits(),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
        }
    }

    /// The bulkhead configuration.
    #[must_use]
    pub fn config(&self) -> &BulkheadConfig {
        &self.config
    }
}

/// Bulkhead statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkheadStats {
    pub operation: String,
    pub max_concurrent: u32,
    pub max_queue_depth: u32,
    pub active_count: u32,
    pub waiting_count: u32,
    pub available_permits: u32,
    pub total_admitted: u64,
    /// Queue-full rejections.
    pub total_rejections: u64,
    /// Queue-timeout rejections.
    pub total_timeouts: u64,
}

impl BulkheadStats {
    /// Calculate utilization (0.0 - 1.0).
    #[must_use]
    pub fn utilization(&self) -> f64 {
        f64::from(self.active_count) / f64::from(self.max_concurrent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn bulkhead(max_concurrent: u32, depth: u32) -> Arc<Bulkhead> {
        Arc::new(Bulkhead::new(
            "test",
            BulkheadConfig::new(max_concurrent).with_queue_depth(depth),
        ))
    }

    #[tokio::test]
    async fn test_immediate_admission() {
        let bulkhead = bulkhead(2, 0);
        let ctx = CallContext::new();

        let a = bulkhead.acquire(Duration::from_millis(10), &ctx).await.unwrap();
        let _b = bulkhead.acquire(Duration::from_millis(10), &ctx).await.unwrap();
        assert_eq!(a.waited(), Duration::ZERO);
        assert_eq!(bulkhead.active_count(), 2);
        assert_eq!(bulkhead.available_permits(), 0);

        let rejected = bulkhead.acquire(Duration::from_millis(10), &ctx).await;
        assert_eq!(
            rejected.unwrap_err(),
            AcquireError::Rejected(RejectReason::QueueFull)
        );
        assert_eq!(bulkhead.stats().total_rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout() {
        let bulkhead = bulkhead(1, 1);
        let ctx = CallContext::new();
        let _held = bulkhead.acquire(Duration::from_millis(50), &ctx).await.unwrap();

        let start = Instant::now();
        let result = bulkhead.acquire(Duration::from_millis(50), &ctx).await;
        assert_eq!(
            result.unwrap_err(),
            AcquireError::Rejected(RejectReason::QueueTimeout)
        );
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(bulkhead.waiting_count(), 0);
        assert_eq!(bulkhead.stats().total_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_admitted_on_release() {
        let bulkhead = bulkhead(1, 1);
        let held = bulkhead
            .acquire(Duration::from_millis(50), &CallContext::new())
            .await
            .unwrap();

        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                bulkhead
                    .acquire(Duration::from_secs(1), &CallContext::new())
                    .await
                    .map(|t| t.waited())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bulkhead.waiting_count(), 1);
        held.release();

        let waited = waiter.await.unwrap().unwrap();
        assert!(waited >= Duration::from_millis(20));
        assert_eq!(bulkhead.waiting_count(), 0);
    }

    #[tokio::test]
    async fn test_queued_acquire_is_pending_until_release() {
        use tokio_test::{assert_pending, assert_ready_ok, task};

        let bulkhead = bulkhead(1, 1);
        let ctx = CallContext::new();
        let held = bulkhead.acquire(Duration::from_secs(5), &ctx).await.unwrap();

        let mut queued = task::spawn(bulkhead.acquire(Duration::from_secs(5), &ctx));
        assert_pending!(queued.poll());
        assert_eq!(bulkhead.waiting_count(), 1);

        held.release();
        assert!(queued.is_woken());
        let ticket = assert_ready_ok!(queued.poll());
        assert_eq!(bulkhead.active_count(), 1);
        assert_eq!(bulkhead.waiting_count(), 0);
        drop(ticket);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_admission() {
        let bulkhead = bulkhead(1, 3);
        let held = bulkhead
            .acquire(Duration::from_secs(1), &CallContext::new())
            .await
            .unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for id in 1..=3 {
            let bulkhead = bulkhead.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let ticket = bulkhead
                    .acquire(Duration::from_secs(1), &CallContext::new())
                    .await
                    .unwrap();
                order.lock().unwrap().push(id);
                tokio::time::sleep(Duration::from_millis(1)).await;
                ticket.release();
            }));
            // let each waiter enqueue before the next
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert_eq!(bulkhead.waiting_count(), 3);
        held.release();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_releases_queue_position() {
        let bulkhead = bulkhead(1, 1);
        let _held = bulkhead
            .acquire(Duration::from_secs(1), &CallContext::new())
            .await
            .unwrap();

        let ctx = CallContext::new();
        let token = ctx.token().clone();
        let waiter = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move { bulkhead.acquire(Duration::from_secs(10), &ctx).await })
        };

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(bulkhead.waiting_count(), 1);
        token.cancel();

        assert_eq!(waiter.await.unwrap().unwrap_err(), AcquireError::Cancelled);
        assert_eq!(bulkhead.waiting_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_deadline_while_queued() {
        let bulkhead = bulkhead(1, 1);
        let _held = bulkhead
            .acquire(Duration::from_secs(1), &CallContext::new())
            .await
            .unwrap();

        let ctx = CallContext::new().with_timeout(Duration::from_millis(10));
        let result = bulkhead.acquire(Duration::from_secs(1), &ctx).await;
        assert_eq!(result.unwrap_err(), AcquireError::DeadlineExceeded);
    }

    #[tokio::test]
    async fn test_ticket_released_on_panic() {
        let bulkhead = bulkhead(1, 0);
        let task = {
            let bulkhead = bulkhead.clone();
            tokio::spawn(async move {
                let _ticket = bulkhead
                    .acquire(Duration::from_millis(10), &CallContext::new())
                    .await
                    .unwrap();
                panic!("callable blew up");
            })
        };

        assert!(task.await.is_err());
        assert_eq!(bulkhead.active_count(), 0);
        assert_eq!(bulkhead.available_permits(), 1);
    }

    #[test]
    fn test_stats_utilization() {
        let stats = BulkheadStats {
            operation: "x".to_string(),
            max_concurrent: 4,
            max_queue_depth: 0,
            active_count: 1,
            waiting_count: 0,
            available_permits: 3,
            total_admitted: 1,
            total_rejections: 0,
            total_timeouts: 0,
        };
        assert!((stats.utilization() - 0.25).abs() < f64::EPSILON);
    }
}
