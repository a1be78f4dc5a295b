// SPDX-License-Identifier: MIT OR Apache-2.0

//! Property tests for the breaker, backoff, bulkhead and policy file.

use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_engine::config::{
    BulkheadConfig, CircuitBreakerConfig, PolicyConfig, PolicyFile, RetryConfig, TimeoutConfig,
    WindowKind,
};
use resilience_engine::error::ErrorKind;
use resilience_engine::runtime::{
    AttemptOutcome, Bulkhead, CallContext, CircuitBreaker, CircuitState, ExponentialBackoff,
    ManualClock,
};

// =============================================================================
// Circuit breaker
// =============================================================================

mod breaker {
    use super::*;

    proptest! {
        /// The breaker opens on the threshold-th failure in the window, never earlier.
        #[test]
        fn opens_exactly_at_threshold(
            threshold in 1u32..8,
            outcomes in prop::collection::vec(any::<bool>(), 1..40),
        ) {
            let clock = ManualClock::new();
            let breaker = CircuitBreaker::with_clock(
                "prop",
                CircuitBreakerConfig::new()
                    .with_failure_threshold(threshold)
                    .with_window_size(Duration::from_secs(60)),
                Arc::new(clock),
            );

            let mut failures = 0u32;
            for (i, succeeded) in outcomes.into_iter().enumerate() {
                let Ok(permission) = breaker.permit() else {
                    prop_assert!(failures >= threshold);
                    break;
                };
                let attempt = u32::try_from(i).unwrap_or(u32::MAX) + 1;
                let outcome = if succeeded {
                    AttemptOutcome::success(attempt, Duration::ZERO)
                } else {
                    failures += 1;
                    AttemptOutcome::failure(attempt, ErrorKind::Transient, Duration::ZERO)
                };

                let status = breaker.record_outcome(permission, &outcome);
                prop_assert_eq!(status == CircuitState::Open, failures >= threshold);
            }
        }

        /// While open, every permit is rejected until the open duration passes,
        /// then exactly one probe is admitted.
        #[test]
        fn single_probe_after_open_duration(
            open_ms in 1u64..10_000,
            early_checks in 1usize..10,
            contenders in 1usize..10,
        ) {
            let clock = ManualClock::new();
            let breaker = CircuitBreaker::with_clock(
                "prop",
                CircuitBreakerConfig::new()
                    .with_failure_threshold(1)
                    .with_open_duration(Duration::from_millis(open_ms)),
                Arc::new(clock.clone()),
            );
            let permission = breaker.permit().unwrap();
            breaker.record_outcome(permission, &AttemptOutcome::timeout(1, Duration::ZERO));

            for _ in 0..early_checks {
                prop_assert!(breaker.permit().is_err());
            }

            clock.advance(Duration::from_millis(open_ms));
            let probe = breaker.permit();
            prop_assert!(probe.as_ref().is_ok_and(|p| p.is_probe()));
            for _ in 0..contenders {
                prop_assert!(breaker.permit().is_err());
            }
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

mod backoff {
    use super::*;

    proptest! {
        /// Delay after attempt k lies in [0, min(max, base * 2^(k-1))].
        #[test]
        fn delay_within_full_jitter_bound(
            base_ms in 1u64..1_000,
            extra_ms in 0u64..60_000,
            attempt in 1u32..40,
            r in 0.0f64..1.0,
        ) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(base_ms + extra_ms);
            let backoff = ExponentialBackoff::new(base, max);

            let uncapped = u128::from(base_ms) << (attempt - 1);
            let expected_cap = Duration::from_millis(
                u64::try_from(uncapped.min(u128::from(base_ms + extra_ms))).unwrap(),
            );
            prop_assert_eq!(backoff.cap(attempt), expected_cap);
            prop_assert!(backoff.delay_with(attempt, r) <= expected_cap);
            prop_assert!(backoff.delay(attempt) <= expected_cap);
        }

        /// Without jitter the delay is the cap itself.
        #[test]
        fn zero_jitter_is_deterministic(base_ms in 1u64..1_000, attempt in 1u32..12, r in 0.0f64..1.0) {
            let backoff = ExponentialBackoff::new(
                Duration::from_millis(base_ms),
                Duration::from_secs(3_600),
            )
            .with_jitter_fraction(0.0);
            prop_assert_eq!(backoff.delay_with(attempt, r), backoff.cap(attempt));
        }
    }
}

// =============================================================================
// Bulkhead
// =============================================================================

mod bulkhead {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        /// Admitted calls never exceed max_concurrent.
        #[test]
        fn concurrency_never_exceeds_limit(
            max_concurrent in 1u32..6,
            holds in prop::collection::vec(1u64..50, 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let peak = runtime.block_on(async move {
                let depth = u32::try_from(holds.len()).unwrap();
                let bulkhead = Arc::new(Bulkhead::new(
                    "prop",
                    BulkheadConfig::new(max_concurrent).with_queue_depth(depth),
                ));
                let active = Arc::new(AtomicU32::new(0));
                let peak = Arc::new(AtomicU32::new(0));

                let tasks: Vec<_> = holds
                    .into_iter()
                    .map(|hold| {
                        let bulkhead = bulkhead.clone();
                        let active = active.clone();
                        let peak = peak.clone();
                        tokio::spawn(async move {
                            let ticket = bulkhead
                                .acquire(Duration::from_secs(3_600), &CallContext::new())
                                .await
                                .unwrap();
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(hold)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            ticket.release();
                        })
                    })
                    .collect();

                for task in tasks {
                    task.await.unwrap();
                }
                assert_eq!(bulkhead.active_count(), 0);
                peak.load(Ordering::SeqCst)
            });

            prop_assert!(peak <= max_concurrent);
            prop_assert!(peak >= 1);
        }
    }
}

// =============================================================================
// Policy file
// =============================================================================

mod policy_file {
    use super::*;

    prop_compose! {
        fn arb_policy()(
            operation in r"[a-z][a-z0-9_.-]{0,20}",
            failure_threshold in 1u32..100,
            success_threshold in 1u32..10,
            open_ms in 1u64..600_000,
            window_ms in 1u64..600_000,
            fixed in any::<bool>(),
            max_attempts in 1u32..10,
            base_ms in 1u64..1_000,
            extra_ms in 0u64..10_000,
            jitter_pct in 0u32..=100,
            per_attempt_ms in 1u64..60_000,
            max_concurrent in 1u32..512,
            queue_depth in 0u32..512,
            queue_ms in 0u64..10_000,
        ) -> PolicyConfig {
            PolicyConfig::new(operation)
                .with_circuit_breaker(
                    CircuitBreakerConfig::new()
                        .with_failure_threshold(failure_threshold)
                        .with_success_threshold(success_threshold)
                        .with_open_duration(Duration::from_millis(open_ms))
                        .with_window_size(Duration::from_millis(window_ms))
                        .with_window(if fixed { WindowKind::Fixed } else { WindowKind::Sliding }),
                )
                .with_retry(
                    RetryConfig::new()
                        .with_max_attempts(max_attempts)
                        .with_base_delay(Duration::from_millis(base_ms))
                        .with_max_delay(Duration::from_millis(base_ms + extra_ms))
                        .with_jitter_fraction(f64::from(jitter_pct) / 100.0),
                )
                .with_timeout(TimeoutConfig::new(Duration::from_millis(per_attempt_ms)))
                .with_bulkhead(
                    BulkheadConfig::new(max_concurrent)
                        .with_queue_depth(queue_depth)
                        .with_queue_timeout(Duration::from_millis(queue_ms)),
                )
        }
    }

    proptest! {
        /// Writing a policy file and reading it back yields identical values.
        #[test]
        fn yaml_round_trip(policy in arb_policy()) {
            prop_assert!(policy.validate().is_ok());
            let file = PolicyFile { policies: vec![policy] };
            let yaml = file.to_yaml().unwrap();
            let reloaded = PolicyFile::from_yaml(&yaml).unwrap();
            prop_assert_eq!(reloaded, file);
        }
    }
}
