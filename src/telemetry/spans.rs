//! Span helpers for validation sessions.

use tracing::{info_span, Span};
use uuid::Uuid;

/// Extension trait for recording outcomes into spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for session spans.
pub struct SessionSpan;

impl SessionSpan {
    /// Create a session span.
    ///
    /// Fields:
    /// - `session_id`: fresh v4 uuid
    /// - `target`: plugin path or identifier
    /// - `mode`: `in_process` or `out_of_process`
    /// - `status`, `outcome`: filled in when the session ends
    pub fn new(target: &str, mode: &'static str) -> Span {
        let session_id = Uuid::new_v4();
        info_span!(
            "validation_session",
            session_id = %session_id,
            target = %target,
            mode,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            outcome = tracing::field::Empty,
        )
    }
}
