// SPDX-License-Identifier: MIT OR Apache-2.0

//! Example: protecting a flaky dependency
//!
//! Registers two operations, runs scripted calls through the orchestrator and
//! prints the resulting breaker states and Prometheus metrics.
//!
//! # Running
//!
//! ```bash
//! RUST_LOG=resilience_engine=debug cargo run --example resilient_call
//! ```

use std::sync::Arc;
use std::time::Duration;

use resilience_engine::config::{
    BulkheadConfig, CircuitBreakerConfig, PolicyConfig, PolicyRegistry, RetryConfig,
    TimeoutConfig,
};
use resilience_engine::runtime::{
    LogSink, LoggingConfig, MetricsCollector, MetricsConfig, MulticastSink,
};
use resilience_engine::testkit::{ScriptedCall, Step};
use resilience_engine::ResilienceOrchestrator;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let registry = PolicyRegistry::builder()
        .with_policy(
            PolicyConfig::new("profile-service")
                .with_retry(
                    RetryConfig::new()
                        .with_max_attempts(4)
                        .with_base_delay(Duration::from_millis(20))
                        .with_max_delay(Duration::from_millis(200)),
                )
                .with_timeout(TimeoutConfig::new(Duration::from_millis(250))),
        )
        .with_policy(
            PolicyConfig::new("billing-service")
                .with_circuit_breaker(
                    CircuitBreakerConfig::new()
                        .with_failure_threshold(3)
                        .with_open_duration(Duration::from_secs(5)),
                )
                .with_retry(RetryConfig::new().with_max_attempts(1))
                .with_bulkhead(BulkheadConfig::new(4).with_queue_depth(8)),
        )
        .build()?;

    let metrics = Arc::new(MetricsCollector::new(
        MetricsConfig::builder().namespace("demo").build(),
    ));
    let sink = MulticastSink::new()
        .with_sink(Arc::new(LogSink::with_config(LoggingConfig::verbose())))
        .with_sink(metrics.clone());

    let engine = ResilienceOrchestrator::builder(registry)
        .with_sink(Arc::new(sink))
        .build()?;

    // A dependency that recovers after two hiccups
    println!("\n--- Transient failures ---");
    let profile = ScriptedCall::succeed_after(2, "alice");
    match engine
        .execute("profile-service", |token| profile.call(token))
        .await
    {
        Ok(out) => println!(
            "got {:?} after {} attempts in {:?}",
            out.value, out.attempts, out.elapsed
        ),
        Err(e) => eprintln!("call failed: {}", e),
    }

    // A dependency that is down: the breaker opens and later calls fail fast
    println!("\n--- Failing dependency ---");
    let billing = ScriptedCall::<u32>::always(Step::transient("connection refused"));
    for i in 1..=5 {
        match engine
            .execute("billing-service", |token| billing.call(token))
            .await
        {
            Ok(out) => println!("call {}: {}", i, out.value),
            Err(e) => println!("call {}: {} ({})", i, e, e.kind()),
        }
    }
    println!("dependency invoked {} times", billing.calls());

    let state = engine.current_state("billing-service")?;
    println!(
        "billing-service breaker: {} ({} failures in window)",
        state.status, state.window_failure_count
    );

    // A slow dependency hits the per-attempt timeout
    println!("\n--- Slow dependency ---");
    let slow = ScriptedCall::always(Step::Succeed("late").after(Duration::from_secs(1)));
    match engine
        .execute("profile-service", |token| slow.call(token))
        .await
    {
        Ok(out) => println!("unexpected success: {}", out.value),
        Err(e) => println!("{} after {} attempts", e.kind(), e.attempts()),
    }

    println!("\n--- Metrics ---");
    println!("{}", metrics.to_prometheus_text());

    Ok(())
}
