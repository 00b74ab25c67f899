//! Telemetry for the validator.
//!
//! Structured logging, session spans and metrics counters. Log output always
//! goes to stderr: stdout carries the worker protocol in a worker process and
//! the text report in the controller.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use metrics::{
    describe_metrics, record_alloc_violations, record_session, record_test_result,
};
pub use spans::{SessionSpan, SpanExt};
