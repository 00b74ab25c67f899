//! Test engine.
//!
//! Runs the selected test cases against instances of one target: discovery,
//! open timing, repeat passes with optional seeded shuffling, message-thread
//! dispatch, panic capture and allocation-violation attribution. The engine
//! blocks; it runs inside the worker process or on a blocking thread of the
//! in-process supervisor.

mod context;
mod message_thread;
mod result;
mod selection;

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use context::TestContext;
pub use message_thread::{DispatchError, MessageThread};
pub use result::TestResult;
pub use selection::{is_selected, order_tests, select_tests};

use crate::config::ValidationOptions;
use crate::crash;
use crate::plugin::{FormatManager, LoaderError, PluginDescription, PluginInstance};
use crate::realtime::{self, Violation};
use crate::suite::{PluginTestCase, TestRegistry};
use crate::telemetry;

/// Prefix of the log line announcing a test. The supervisor uses it to know
/// which test is in flight.
pub const STARTING_TEST_PREFIX: &str = "Starting test: ";
pub const DISCOVERY_TEST: &str = "Plugin discovery";
pub const COLD_OPEN_TEST: &str = "Open plugin (cold)";
pub const WARM_OPEN_TEST: &str = "Open plugin (warm)";
pub const OPEN_TEST: &str = "Open plugin";

/// Violations listed individually under the log-only policy.
const MAX_LOGGED_VIOLATIONS: usize = 16;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Receives engine output as it happens.
pub trait EngineListener: Send + Sync {
    fn log(&self, text: &str);
    fn item_complete(&self, result: &TestResult);
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub sample_rate: f64,
    pub block_size: usize,
    /// Pause after destroying an instance before the next may be opened.
    pub settle_delay: Duration,
    /// Longest wait for the message thread to destroy an instance.
    pub teardown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44_100.0,
            block_size: 512,
            settle_delay: Duration::from_millis(150),
            teardown_timeout: Duration::from_secs(10),
        }
    }
}

/// Totals for one session, sent as the terminal message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub tests: u32,
    pub failures: u32,
    pub seed: u64,
}

pub struct TestEngine<'a> {
    formats: Arc<FormatManager>,
    registry: &'a TestRegistry,
    config: EngineConfig,
    crash_trace: Option<PathBuf>,
}

impl<'a> TestEngine<'a> {
    pub fn new(formats: Arc<FormatManager>, registry: &'a TestRegistry) -> Self {
        Self {
            formats,
            registry,
            config: EngineConfig::default(),
            crash_trace: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Where unattributed violations are noted.
    pub fn with_crash_trace(mut self, path: impl Into<PathBuf>) -> Self {
        self.crash_trace = Some(path.into());
        self
    }

    /// The seed a session will use: the requested one, or a fresh non-zero
    /// seed when 0 is requested.
    pub fn resolve_seed(requested: u64) -> u64 {
        if requested != 0 {
            return requested;
        }
        loop {
            let seed = rand::random::<u64>();
            if seed != 0 {
                return seed;
            }
        }
    }

    /// Validate every plugin type found in `target`.
    pub fn run(
        &self,
        target: &str,
        options: &ValidationOptions,
        listener: Arc<dyn EngineListener>,
    ) -> Result<SessionSummary, EngineError> {
        let options = Arc::new(options.clone());
        let seed = Self::resolve_seed(options.random_seed);
        let mut session = Session {
            listener,
            options: options.clone(),
            crash_trace: self.crash_trace.as_deref(),
            summary: SessionSummary {
                seed,
                ..SessionSummary::default()
            },
        };
        session.log(&format!("Random seed: 0x{seed:x}"));

        let message_thread = MessageThread::spawn()?;
        let formats = self.formats.clone();
        let owned_target = target.to_string();
        let found = message_thread.call(move || formats.find_types(&owned_target), None)?;

        let descriptions = match found {
            Ok(found) if !found.is_empty() => found,
            Ok(_) => {
                session.complete(TestResult::failure(
                    DISCOVERY_TEST,
                    format!("No types found for {target}"),
                ));
                return Ok(session.summary);
            }
            Err(e) => {
                session.complete(TestResult::failure(
                    DISCOVERY_TEST,
                    format!("No types found for {target}: {e}"),
                ));
                return Ok(session.summary);
            }
        };

        let selected = select_tests(self.registry, &options);
        let mut rng = StdRng::seed_from_u64(seed);

        for description in &descriptions {
            session.log(&format!("Validating: {description}"));
            if !self.time_open(&mut session, &message_thread, description, COLD_OPEN_TEST)? {
                continue;
            }
            self.time_open(&mut session, &message_thread, description, WARM_OPEN_TEST)?;

            for iteration in 1..=options.repeat {
                if options.repeat > 1 {
                    session.log(&format!("Iteration {iteration} of {}", options.repeat));
                }
                let ordered = order_tests(&selected, options.randomise, &mut rng);

                let mut plugin = match self.create(&message_thread, description)? {
                    Ok(plugin) => plugin,
                    Err(e) => {
                        session.complete(TestResult::failure(
                            OPEN_TEST,
                            format!("Failed to create instance: {e}"),
                        ));
                        break;
                    }
                };
                for case in ordered {
                    let case_seed = rng.gen::<u64>();
                    plugin = self.run_case(&mut session, &message_thread, case, plugin, case_seed)?;
                }
                self.teardown(&session, &message_thread, plugin);
            }
        }

        Ok(session.summary)
    }

    fn create(
        &self,
        message_thread: &MessageThread,
        description: &PluginDescription,
    ) -> Result<Result<Box<dyn PluginInstance>, LoaderError>, EngineError> {
        let formats = self.formats.clone();
        let description = description.clone();
        let EngineConfig {
            sample_rate,
            block_size,
            ..
        } = self.config;
        Ok(message_thread.call(
            move || formats.create_instance(&description, sample_rate, block_size),
            None,
        )?)
    }

    /// Destroy on the message thread, then let the plugin settle.
    fn teardown(
        &self,
        session: &Session<'_>,
        message_thread: &MessageThread,
        plugin: Box<dyn PluginInstance>,
    ) {
        let destroyed = message_thread.call(
            move || {
                let mut plugin = plugin;
                plugin.release();
                drop(plugin);
            },
            Some(self.config.teardown_timeout),
        );
        if let Err(e) = destroyed {
            session.log(&format!("Instance teardown did not complete: {e}"));
        }
        std::thread::sleep(self.config.settle_delay);
    }

    /// Report how long creating an instance takes. Returns false if the
    /// instance could not be created.
    fn time_open(
        &self,
        session: &mut Session<'_>,
        message_thread: &MessageThread,
        description: &PluginDescription,
        name: &str,
    ) -> Result<bool, EngineError> {
        session.log(&format!("{STARTING_TEST_PREFIX}{name}"));
        let mut result = TestResult::started(name);
        result.pseudo = true;

        let started = Instant::now();
        let created = self.create(message_thread, description)?;
        let elapsed = started.elapsed();

        let opened = match created {
            Ok(plugin) => {
                let line = format!("Time taken to {}: {} ms", name.to_lowercase(), elapsed.as_millis());
                session.log(&line);
                result.output.push(line);
                result.passes = 1;
                self.teardown(session, message_thread, plugin);
                true
            }
            Err(e) => {
                let message = format!("Failed to create instance: {e}");
                session.log(&format!("!!! Test failed: {message}"));
                result.add_failure(message);
                false
            }
        };
        result.finish();
        session.complete(result);
        Ok(opened)
    }

    fn run_case(
        &self,
        session: &mut Session<'_>,
        message_thread: &MessageThread,
        case: Arc<dyn PluginTestCase>,
        plugin: Box<dyn PluginInstance>,
        seed: u64,
    ) -> Result<Box<dyn PluginInstance>, EngineError> {
        let name = case.name().to_string();
        session.log(&format!("{STARTING_TEST_PREFIX}{name}"));

        let attribution = realtime::begin_test();
        let token = attribution.token();
        let ctx = TestContext::new(
            &name,
            session.options.clone(),
            self.config,
            seed,
            session.listener.clone(),
        );

        let (plugin, mut ctx) = if case.needs_message_thread() {
            message_thread.call(
                move || {
                    let mut plugin = plugin;
                    let mut ctx = ctx;
                    run_guarded(case.as_ref(), plugin.as_mut(), &mut ctx);
                    (plugin, ctx)
                },
                None,
            )?
        } else {
            let mut plugin = plugin;
            let mut ctx = ctx;
            run_guarded(case.as_ref(), plugin.as_mut(), &mut ctx);
            (plugin, ctx)
        };
        drop(attribution);

        session.attribute_violations(&mut ctx, token);
        session.complete(ctx.into_result());
        Ok(plugin)
    }
}

/// Run a case, turning a panic into a failure on its result.
fn run_guarded(case: &dyn PluginTestCase, plugin: &mut dyn PluginInstance, ctx: &mut TestContext) {
    let outcome = {
        let _scope = crash::catching_unwind();
        catch_unwind(AssertUnwindSafe(|| case.run(plugin, ctx)))
    };
    if let Err(payload) = outcome {
        ctx.fail(format!("Test panicked: {}", panic_message(payload.as_ref())));
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Session<'e> {
    listener: Arc<dyn EngineListener>,
    options: Arc<ValidationOptions>,
    crash_trace: Option<&'e Path>,
    summary: SessionSummary,
}

impl Session<'_> {
    fn log(&self, text: &str) {
        self.listener.log(text);
    }

    fn complete(&mut self, result: TestResult) {
        self.summary.tests += 1;
        self.summary.failures += result.failures;
        telemetry::record_test_result(!result.passed(), result.duration_ms());
        tracing::debug!(
            test = %result.name,
            failures = result.failures,
            duration_ms = result.duration_ms(),
            "test complete"
        );
        self.listener.item_complete(&result);
    }

    /// Drain the violation ring: records from this test go to `ctx`, the rest
    /// are noted in the crash trace and the session log.
    fn attribute_violations(&self, ctx: &mut TestContext, token: u64) {
        let batch = realtime::drain_violations();
        if batch.is_empty() {
            return;
        }
        let dropped = batch.dropped;
        let (mine, unattributed) = batch.partition(token);
        telemetry::record_alloc_violations(mine.len() + unattributed.len());

        if !mine.is_empty() || dropped > 0 {
            if realtime::policy().fails_test() {
                ctx.fail(violation_summary(&mine, dropped));
            } else {
                for violation in mine.iter().take(MAX_LOGGED_VIOLATIONS) {
                    ctx.log(format!("Real-time violation (logged): {violation}"));
                }
                if mine.len() > MAX_LOGGED_VIOLATIONS || dropped > 0 {
                    ctx.log(violation_summary(&mine, dropped));
                }
            }
        }

        for violation in unattributed {
            let note = format!("Unattributed allocation violation: {violation}");
            self.log(&note);
            if let Some(path) = self.crash_trace {
                if let Err(e) = crash::append_note(path, &note) {
                    tracing::warn!(error = %e, "failed to note violation in crash trace");
                }
            }
        }
    }
}

fn violation_summary(violations: &[Violation], dropped: u64) -> String {
    let mut message = format!(
        "Real-time violation: {} allocation call(s) inside a real-time window",
        violations.len()
    );
    if let Some(first) = violations.first() {
        message.push_str(&format!(" (first: {first})"));
    }
    if dropped > 0 {
        message.push_str(&format!(", {dropped} more not recorded"));
    }
    message
}
