//! Metrics emitted through the `metrics` facade.
//!
//! No recorder is installed by the binary; embedders that want the numbers
//! install their own exporter before running sessions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};

/// Register descriptions for every metric the validator emits.
pub fn describe_metrics() {
    describe_counter!("plugcheck_tests_total", "Test results produced, by outcome");
    describe_counter!(
        "plugcheck_alloc_violations_total",
        "Allocations observed inside real-time windows"
    );
    describe_counter!("plugcheck_sessions_total", "Validation sessions, by outcome");
    describe_histogram!(
        "plugcheck_test_duration_ms",
        Unit::Milliseconds,
        "Wall-clock duration of each test"
    );
}

pub fn record_test_result(failed: bool, duration_ms: u64) {
    let outcome = if failed { "fail" } else { "pass" };
    counter!("plugcheck_tests_total", "outcome" => outcome).increment(1);
    histogram!("plugcheck_test_duration_ms").record(duration_ms as f64);
}

pub fn record_alloc_violations(count: usize) {
    if count > 0 {
        counter!("plugcheck_alloc_violations_total").increment(count as u64);
    }
}

pub fn record_session(outcome: &'static str) {
    counter!("plugcheck_sessions_total", "outcome" => outcome).increment(1);
}
