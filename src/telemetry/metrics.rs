//! Metric instrument factories for runner-rs.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without one (tests, no OTLP endpoint) every instrument is a no-op.

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("runner-rs")
}

/// Counter: work items pulled off the queue.
pub fn work_received() -> Counter<u64> {
    meter()
        .u64_counter("runner.work.received")
        .with_description("Work items pulled by workers")
        .build()
}

/// Counter: results produced.
/// Labels: `outcome` ("ok" | "exit_nonzero" | "error").
pub fn work_completed() -> Counter<u64> {
    meter()
        .u64_counter("runner.work.completed")
        .with_description("Results produced by workers")
        .build()
}

/// Histogram: subprocess execution time in milliseconds.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("runner.work.duration_ms")
        .with_description("Subprocess execution time")
        .with_unit("ms")
        .build()
}

/// Counter: broker operations.
/// Labels: `broker`, `operation`.
pub fn broker_operations() -> Counter<u64> {
    meter()
        .u64_counter("runner.broker.operations")
        .with_description("Number of broker operations")
        .build()
}

/// Counter: control messages handled by pools.
/// Labels: `command` ("stop" | "invalid").
pub fn control_commands() -> Counter<u64> {
    meter()
        .u64_counter("runner.control.commands")
        .with_description("Control messages received")
        .build()
}

pub fn record_broker_operation(broker: &'static str, operation: &'static str) {
    broker_operations().add(
        1,
        &[
            KeyValue::new("broker", broker),
            KeyValue::new("operation", operation),
        ],
    );
}

/// Record one finished item: outcome counter plus, when it ran, its duration.
pub fn record_result(exit_code: i32, errored: bool, execute_ms: Option<i64>) {
    let outcome = match (errored, exit_code) {
        (true, _) => "error",
        (false, 0) => "ok",
        (false, _) => "exit_nonzero",
    };
    work_completed().add(1, &[KeyValue::new("outcome", outcome)]);
    if let Some(ms) = execute_ms {
        work_duration_ms().record(ms as f64, &[]);
    }
}
