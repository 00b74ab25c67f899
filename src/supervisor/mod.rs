//! Validation supervisor.
//!
//! Runs one session at a time, either inside a worker process (the default,
//! which isolates crashes and hangs) or in-process for debugging. Both modes
//! produce the same [`ValidationEvent`] stream, ending in exactly one
//! terminal event.

mod events;
mod in_process;
mod process;
pub mod protocol;
mod state;
mod watchdog;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use events::{EventSender, SessionOutcome, ValidationEvent};
pub use protocol::{ProtocolError, WorkerMessage};
pub use state::{SessionState, SessionStateMachine, StateError};
pub use watchdog::Watchdog;

use crate::config::{ConfigError, ValidationOptions};
use crate::crash::{self, CrashError};
use crate::engine::{EngineConfig, EngineError, TestResult, STARTING_TEST_PREFIX};
use crate::plugin::FormatManager;
use crate::suite::TestRegistry;
use crate::telemetry::{self, SessionSpan, SpanExt};

/// Name given to failures that belong to the session rather than a test.
pub const SESSION_ITEM: &str = "Validation session";

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Failed to start worker {exe}: {source}")]
    Spawn {
        exe: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Crash trace {path} unusable: {source}")]
    TraceFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Options(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Crash(#[from] CrashError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    InProcess,
    #[default]
    OutOfProcess,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProcess => "in_process",
            Self::OutOfProcess => "out_of_process",
        }
    }
}

#[derive(Clone)]
pub struct SupervisorConfig {
    pub mode: ExecutionMode,
    /// Executable that understands the `worker` subcommand.
    pub worker_exe: PathBuf,
    pub crash_trace: PathBuf,
    /// How long a worker may take to exit after its output closes.
    pub exit_grace: Duration,
    pub engine: EngineConfig,
    pub formats: Arc<FormatManager>,
    pub registry: Arc<TestRegistry>,
}

impl SupervisorConfig {
    /// Out-of-process configuration re-invoking the current executable.
    pub fn new(registry: Arc<TestRegistry>) -> Result<Self, SupervisorError> {
        let worker_exe = std::env::current_exe().map_err(|source| SupervisorError::Spawn {
            exe: PathBuf::from("plugcheck"),
            source,
        })?;
        Ok(Self {
            mode: ExecutionMode::OutOfProcess,
            worker_exe,
            crash_trace: crash::default_trace_path(),
            exit_grace: Duration::from_secs(5),
            engine: EngineConfig::default(),
            formats: Arc::new(FormatManager::with_builtin_formats()),
            registry,
        })
    }
}

/// Drives validation sessions, one at a time.
pub struct Supervisor {
    config: SupervisorConfig,
    state: SessionStateMachine,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            state: SessionStateMachine::new(),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    /// Validate one target. Never fails: every error ends the event stream
    /// with a failure result and a terminal event.
    pub async fn run_session(
        &mut self,
        target: &str,
        options: &ValidationOptions,
        events: EventSender,
        cancel: CancellationToken,
    ) -> SessionOutcome {
        let span = SessionSpan::new(target, self.config.mode.as_str());
        let outcome = async {
            let result = match self.config.mode {
                ExecutionMode::OutOfProcess => {
                    process::run(&self.config, &mut self.state, target, options, &events, &cancel)
                        .await
                }
                ExecutionMode::InProcess => {
                    in_process::run(&self.config, &mut self.state, target, options, &events, &cancel)
                        .await
                }
            };
            tracing::Span::current().record_result(&result);

            match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(error = %e, "session failed");
                    let mut failure = TestResult::failure(SESSION_ITEM, e.to_string());
                    failure.incomplete = true;
                    events.send(ValidationEvent::item_complete(failure));
                    events.send(ValidationEvent::ConnectionLost {
                        outcome: SessionOutcome::Disconnected,
                        reason: e.to_string(),
                    });
                    SessionOutcome::Disconnected
                }
            }
        }
        .instrument(span.clone())
        .await;

        span.record("outcome", outcome.as_str());
        telemetry::record_session(outcome.as_str());
        self.state.reset();
        outcome
    }
}

/// The test the worker most recently announced and has not completed,
/// with the lines it logged so far.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    current: Option<TestResult>,
}

impl InFlight {
    pub(crate) fn observe_log(&mut self, text: &str) {
        if let Some(name) = text.strip_prefix(STARTING_TEST_PREFIX) {
            self.current = Some(TestResult::started(name.trim()));
        }
        if let Some(current) = self.current.as_mut() {
            current.output.push(text.to_string());
        }
    }

    pub(crate) fn observe_complete(&mut self, name: &str) {
        if self.current.as_ref().is_some_and(|c| c.name == name) {
            self.current = None;
        }
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.name.as_str())
    }

    /// Result for the interrupted test, or a session-level item when no
    /// test was running.
    pub(crate) fn take_incomplete(&mut self, message: impl Into<String>) -> TestResult {
        let mut result = self
            .current
            .take()
            .unwrap_or_else(|| TestResult::started(SESSION_ITEM));
        result.mark_incomplete(message);
        result
    }
}
