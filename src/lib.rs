//! plugcheck: a validator for native audio plugins.
//!
//! Each target is exercised by a seeded, strictness-filtered test suite. By
//! default the plugin runs inside a worker process supervised over a line
//! protocol, so a crash or hang fails the session instead of the validator.
//!
//! # Layout
//!
//! - [`realtime`]: allocator hook detecting allocations in real-time windows
//! - [`crash`]: fatal-signal and panic trace for worker processes
//! - [`engine`]: test selection, ordering and execution for one target
//! - [`supervisor`]: worker process management, watchdog, event stream
//! - [`orchestrator`]: multi-target sequencing
//! - [`report`]: aggregation, text and JUnit output

pub mod config;
pub mod crash;
pub mod engine;
pub mod orchestrator;
pub mod plugin;
pub mod realtime;
pub mod report;
pub mod suite;
pub mod supervisor;
pub mod telemetry;

pub use config::{CliOverrides, ConfigError, EnvOverlay, ValidationOptions};
pub use engine::{EngineConfig, TestEngine, TestResult};
pub use orchestrator::{expand_targets, Orchestrator, OrchestratorError};
pub use report::{AggregatedReport, TargetReport};
pub use supervisor::{
    ExecutionMode, SessionOutcome, Supervisor, SupervisorConfig, SupervisorError, ValidationEvent,
};

#[global_allocator]
static GLOBAL: realtime::InterceptingAllocator = realtime::InterceptingAllocator;
