//! plugcheck entry point.
//!
//! ## Subcommands
//!
//! - `plugcheck [validate] TARGET...` - validate plugins (default)
//! - `plugcheck worker ...` - internal, runs one session for a supervisor

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use plugcheck::config::{CliOverrides, EnvOverlay, ValidationOptions};
use plugcheck::orchestrator::{self, Orchestrator};
use plugcheck::plugin::FormatManager;
use plugcheck::suite::TestRegistry;
use plugcheck::supervisor::worker::{run_worker, IpcWriter, WorkerArgs};
use plugcheck::supervisor::{ExecutionMode, Supervisor, SupervisorConfig};
use plugcheck::telemetry::{self, LogConfig, LogFormat};

#[derive(Debug, Parser)]
#[command(name = "plugcheck", version, about = "Validate native audio plugins")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate one or more plugins (files, directories or identifiers).
    Validate(ValidateArgs),
    /// Run a single session and report over stdout.
    #[command(hide = true)]
    Worker(WorkerCommand),
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(required = true, value_name = "TARGET")]
    targets: Vec<String>,

    /// Run tests up to this level (1-10).
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=10))]
    strictness_level: Option<u8>,

    /// Seed for ordering and randomised tests; 0 picks one. Accepts 0x hex.
    #[arg(long, value_parser = parse_seed)]
    random_seed: Option<u64>,

    /// Abort a session after this long without output from the plugin.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Run the suite this many times per target.
    #[arg(long)]
    repeat: Option<u32>,

    /// Shuffle test order within each repeat.
    #[arg(long)]
    randomise: bool,

    #[arg(long)]
    skip_gui_tests: bool,

    /// Skip a test by name. Repeatable.
    #[arg(long = "disable-test", value_name = "NAME")]
    disabled_tests: Vec<String>,

    #[arg(long)]
    data_file: Option<PathBuf>,

    /// Write per-target text reports and junit.xml here.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    #[arg(long)]
    verbose: bool,

    /// Run plugins inside this process. No crash or hang isolation.
    #[arg(long)]
    in_process: bool,

    /// What to do on an allocation in a real-time window: log, raise or abort.
    #[arg(long)]
    rtcheck_policy: Option<String>,

    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

#[derive(Debug, Args)]
struct WorkerCommand {
    #[arg(long)]
    target: String,
    #[arg(long)]
    options: String,
    #[arg(long)]
    crash_trace: PathBuf,
    #[arg(long, default_value_t = 150)]
    settle_ms: u64,
}

fn parse_seed(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse(),
    };
    parsed.map_err(|e| format!("invalid seed {raw:?}: {e}"))
}

/// Insert `validate` when the first argument is not a subcommand or a
/// top-level flag.
fn with_implied_validate(args: impl IntoIterator<Item = OsString>) -> Vec<OsString> {
    let mut args: Vec<OsString> = args.into_iter().collect();
    let explicit = args.get(1).and_then(|a| a.to_str()).is_some_and(|first| {
        matches!(
            first,
            "validate" | "worker" | "help" | "-h" | "--help" | "-V" | "--version"
        )
    });
    if args.len() > 1 && !explicit {
        args.insert(1, OsString::from("validate"));
    }
    args
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(with_implied_validate(std::env::args_os()));
    match cli.command {
        Command::Worker(args) => worker_main(args),
        Command::Validate(args) => {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    eprintln!("Failed to start runtime: {e}");
                    return ExitCode::FAILURE;
                }
            };
            runtime.block_on(validate_main(args))
        }
    }
}

fn worker_main(args: WorkerCommand) -> ExitCode {
    if let Err(e) = telemetry::init_logging(&LogConfig::default()) {
        eprintln!("Logging unavailable: {e}");
    }

    let writer = match IpcWriter::claim_stdout() {
        Ok(writer) => Arc::new(writer),
        Err(e) => {
            tracing::error!(error = %e, "cannot open supervisor channel");
            return ExitCode::FAILURE;
        }
    };
    let registry = match TestRegistry::builtin() {
        Ok(registry) => registry,
        Err(e) => {
            tracing::error!(error = %e, "invalid test registry");
            return ExitCode::FAILURE;
        }
    };

    let args = WorkerArgs {
        target: args.target,
        options: args.options,
        crash_trace: args.crash_trace,
        settle_ms: args.settle_ms,
    };
    let formats = Arc::new(FormatManager::with_builtin_formats());
    match run_worker(&args, writer, formats, &registry) {
        Ok(summary) => {
            tracing::debug!(tests = summary.tests, failures = summary.failures, "worker done");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn validate_main(args: ValidateArgs) -> ExitCode {
    let log_config = LogConfig {
        format: args.log_format,
        ..LogConfig::for_verbosity(args.verbose)
    };
    if let Err(e) = telemetry::init_logging(&log_config) {
        eprintln!("Logging unavailable: {e}");
    }
    telemetry::describe_metrics();

    let overrides = CliOverrides {
        strictness_level: args.strictness_level,
        random_seed: args.random_seed,
        timeout_ms: args.timeout_ms,
        repeat: args.repeat,
        randomise: args.randomise,
        skip_gui_tests: args.skip_gui_tests,
        verbose: args.verbose,
        disabled_tests: args.disabled_tests,
        data_file: args.data_file,
        output_dir: args.output_dir,
        rtcheck_policy: args.rtcheck_policy,
    };
    let options = match ValidationOptions::resolve(&overrides, &EnvOverlay::load()) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Invalid options: {e}");
            return ExitCode::FAILURE;
        }
    };

    let targets = match orchestrator::expand_targets(&args.targets) {
        Ok(targets) => targets,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let registry = match TestRegistry::builtin() {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            eprintln!("Invalid test registry: {e}");
            return ExitCode::FAILURE;
        }
    };
    let mut config = match SupervisorConfig::new(registry) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };
    if args.in_process {
        config.mode = ExecutionMode::InProcess;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping validation...");
            on_signal.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(Supervisor::new(config)).echo_logs(options.verbose);
    let report = orchestrator.run(&targets, &options, cancel).await;

    if let Err(e) = orchestrator::publish(&report, &options) {
        eprintln!("{e}");
    }
    ExitCode::from(report.exit_code())
}
