//! Per-test results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one executed test case (or pseudo test) in one repeat pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub passes: u32,
    pub failures: u32,
    /// Failure messages, in the order they were raised.
    pub messages: Vec<String>,
    /// Every line logged while the test ran.
    pub output: Vec<String>,
    /// Timing measurement rather than a registered test.
    #[serde(default)]
    pub pseudo: bool,
    /// Synthesised for a test that never finished.
    #[serde(default)]
    pub incomplete: bool,
}

impl TestResult {
    /// Empty result starting now.
    pub fn started(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            started_at: now,
            ended_at: now,
            passes: 0,
            failures: 0,
            messages: Vec::new(),
            output: Vec::new(),
            pseudo: false,
            incomplete: false,
        }
    }

    /// Result carrying a single failure.
    pub fn failure(name: impl Into<String>, message: impl Into<String>) -> Self {
        let mut result = Self::started(name);
        result.add_failure(message);
        result
    }

    pub fn add_failure(&mut self, message: impl Into<String>) {
        self.failures += 1;
        self.messages.push(message.into());
    }

    pub fn finish(&mut self) {
        self.ended_at = Utc::now();
    }

    /// Mark a test that was cut short. Always counts as a failure.
    pub fn mark_incomplete(&mut self, message: impl Into<String>) {
        self.incomplete = true;
        self.add_failure(message);
        self.finish();
    }

    pub fn passed(&self) -> bool {
        self.failures == 0
    }

    pub fn duration_ms(&self) -> u64 {
        (self.ended_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn failure_result_has_one_message() {
        let result = TestResult::failure("Plugin discovery", "No types found");
        assert_eq!(result.failures, 1);
        assert_eq!(result.messages, vec!["No types found".to_string()]);
        assert!(!result.passed());
    }

    #[test]
    fn incomplete_counts_as_failure() {
        let mut result = TestResult::started("Audio processing");
        result.output.push("Starting test: Audio processing".into());
        result.mark_incomplete("did not respond");
        assert!(result.incomplete);
        assert_eq!(result.failures, 1);
    }

    #[test]
    fn duration_never_negative() {
        let mut result = TestResult::started("x");
        result.ended_at = result.started_at + Duration::milliseconds(1500);
        assert_eq!(result.duration_ms(), 1500);
        result.ended_at = result.started_at - Duration::milliseconds(10);
        assert_eq!(result.duration_ms(), 0);
    }

    #[test]
    fn flags_default_when_absent() {
        let json = r#"{"name":"a","started_at":"2024-01-01T00:00:00Z","ended_at":"2024-01-01T00:00:01Z","passes":1,"failures":0,"messages":[],"output":[]}"#;
        let result: TestResult = serde_json::from_str(json).unwrap();
        assert!(!result.pseudo);
        assert!(!result.incomplete);
        assert_eq!(result.duration_ms(), 1000);
    }
}
