//! The logging and assertion sink handed to each test case.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{EngineConfig, EngineListener, TestResult};
use crate::config::ValidationOptions;
use crate::realtime::{self, RealtimeGuard};

/// Per-test context. Every method is safe to call inside a real-time window;
/// its own bookkeeping never counts as a violation.
pub struct TestContext {
    result: TestResult,
    options: Arc<ValidationOptions>,
    config: EngineConfig,
    rng: StdRng,
    listener: Arc<dyn EngineListener>,
}

impl TestContext {
    pub(crate) fn new(
        name: &str,
        options: Arc<ValidationOptions>,
        config: EngineConfig,
        seed: u64,
        listener: Arc<dyn EngineListener>,
    ) -> Self {
        Self {
            result: TestResult::started(name),
            options,
            config,
            rng: StdRng::seed_from_u64(seed),
            listener,
        }
    }

    pub fn name(&self) -> &str {
        &self.result.name
    }

    /// Log a line. It is recorded on the result and forwarded immediately,
    /// which also keeps the supervisor's watchdog from firing.
    pub fn log(&mut self, text: impl Into<String>) {
        let _permit = realtime::allow_allocations();
        let text = text.into();
        self.listener.log(&text);
        self.result.output.push(text);
    }

    pub fn pass(&mut self) {
        self.result.passes += 1;
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let _permit = realtime::allow_allocations();
        let message = message.into();
        self.log(format!("!!! Test failed: {message}"));
        self.result.add_failure(message);
    }

    /// Record a pass when `condition` holds, otherwise a failure.
    pub fn expect(&mut self, condition: bool, message: impl Into<String>) -> bool {
        if condition {
            self.pass();
        } else {
            self.fail(message);
        }
        condition
    }

    pub fn expect_eq<T: PartialEq + Debug>(&mut self, actual: T, expected: T, what: &str) -> bool {
        if actual == expected {
            self.pass();
            true
        } else {
            self.fail(format!("{what}: expected {expected:?}, got {actual:?}"));
            false
        }
    }

    pub fn options(&self) -> &ValidationOptions {
        &self.options
    }

    /// Generator seeded from the session seed; deterministic per test.
    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    pub fn data_file(&self) -> Option<&Path> {
        self.options.data_file.as_deref()
    }

    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn realtime_checks_enabled(&self) -> bool {
        self.options.realtime_checks_enabled()
    }

    /// Open a real-time window if the strictness level calls for one.
    pub fn realtime_window(&self) -> Option<RealtimeGuard> {
        self.realtime_checks_enabled()
            .then(realtime::realtime_window)
    }

    pub(crate) fn into_result(mut self) -> TestResult {
        self.result.finish();
        self.result
    }
}
