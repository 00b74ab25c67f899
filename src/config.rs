//! Validation options and where they come from.
//!
//! Options are layered: built-in defaults, then environment variables, then
//! explicit command-line flags. A flag given on the command line always wins
//! over the environment. Invalid environment values fall back to defaults
//! without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `STRICTNESS_LEVEL` | 5 | Strictness level (1-10) |
//! | `RANDOM_SEED` | 0 | Seed for test ordering (0 = fresh) |
//! | `TIMEOUT_MS` | 30000 | Max silence from a worker before it is killed |
//! | `VERBOSE` | false | Stream worker log output live |
//! | `REPEAT` | 1 | Number of passes over the test list |
//! | `RANDOMISE` | false | Shuffle test order |
//! | `SKIP_GUI_TESTS` | false | Skip tests that open an editor |
//! | `DATA_FILE` | - | Data file handed to tests |
//! | `OUTPUT_DIR` | - | Directory for text and JUnit reports |
//! | `RTCHECK_POLICY` | raise | Allocation violation policy (log, raise, abort) |

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::realtime::{UnknownPolicy, ViolationPolicy};

pub const MIN_STRICTNESS: u8 = 1;
pub const MAX_STRICTNESS: u8 = 10;
pub const DEFAULT_STRICTNESS: u8 = 5;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
/// Strictness at which real-time windows are armed.
pub const DEFAULT_REALTIME_LEVEL: u8 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Strictness level {0} out of range ({MIN_STRICTNESS}-{MAX_STRICTNESS})")]
    StrictnessOutOfRange(u8),

    #[error("Repeat count must be at least 1")]
    ZeroRepeat,

    #[error("Timeout must be greater than zero")]
    ZeroTimeout,

    #[error(transparent)]
    Policy(#[from] UnknownPolicy),

    #[error("Invalid options payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Options for one validation session. Immutable once the session starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOptions {
    pub strictness_level: u8,
    /// 0 means "generate a fresh seed when the session starts".
    pub random_seed: u64,
    pub repeat: u32,
    pub randomise: bool,
    pub with_gui: bool,
    /// Maximum silence between two worker messages.
    pub timeout_ms: u64,
    pub disabled_tests: BTreeSet<String>,
    pub data_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub verbose: bool,
    pub violation_policy: ViolationPolicy,
    pub realtime_level: u8,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            strictness_level: DEFAULT_STRICTNESS,
            random_seed: 0,
            repeat: 1,
            randomise: false,
            with_gui: true,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            disabled_tests: BTreeSet::new(),
            data_file: None,
            output_dir: None,
            verbose: false,
            violation_policy: ViolationPolicy::default(),
            realtime_level: DEFAULT_REALTIME_LEVEL,
        }
    }
}

impl ValidationOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn is_disabled(&self, test_name: &str) -> bool {
        self.disabled_tests.contains(test_name)
    }

    /// Whether real-time windows are enforced at this strictness.
    pub fn realtime_checks_enabled(&self) -> bool {
        self.strictness_level >= self.realtime_level
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_STRICTNESS..=MAX_STRICTNESS).contains(&self.strictness_level) {
            return Err(ConfigError::StrictnessOutOfRange(self.strictness_level));
        }
        if self.repeat == 0 {
            return Err(ConfigError::ZeroRepeat);
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Merge CLI overrides over environment values over defaults.
    pub fn resolve(cli: &CliOverrides, env: &EnvOverlay) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let violation_policy = match &cli.rtcheck_policy {
            Some(raw) => raw.parse::<ViolationPolicy>()?,
            None => env.rtcheck_policy.unwrap_or(defaults.violation_policy),
        };

        let options = Self {
            strictness_level: cli
                .strictness_level
                .or(env.strictness_level)
                .unwrap_or(defaults.strictness_level),
            random_seed: cli.random_seed.or(env.random_seed).unwrap_or(0),
            repeat: cli.repeat.or(env.repeat).unwrap_or(defaults.repeat),
            randomise: cli.randomise || env.randomise.unwrap_or(false),
            with_gui: !(cli.skip_gui_tests || env.skip_gui_tests.unwrap_or(false)),
            timeout_ms: cli.timeout_ms.or(env.timeout_ms).unwrap_or(defaults.timeout_ms),
            disabled_tests: cli.disabled_tests.iter().cloned().collect(),
            data_file: cli.data_file.clone().or_else(|| env.data_file.clone()),
            output_dir: cli.output_dir.clone().or_else(|| env.output_dir.clone()),
            verbose: cli.verbose || env.verbose.unwrap_or(false),
            violation_policy,
            realtime_level: defaults.realtime_level,
        };
        options.validate()?;
        Ok(options)
    }

    /// Encode for handing to a worker process.
    pub fn to_payload(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a payload produced by [`ValidationOptions::to_payload`].
    pub fn from_payload(payload: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(payload)?;
        options.validate()?;
        Ok(options)
    }
}

/// Values given explicitly on the command line.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub strictness_level: Option<u8>,
    pub random_seed: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub repeat: Option<u32>,
    pub randomise: bool,
    pub skip_gui_tests: bool,
    pub verbose: bool,
    pub disabled_tests: Vec<String>,
    pub data_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub rtcheck_policy: Option<String>,
}

/// Values found in the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverlay {
    pub strictness_level: Option<u8>,
    pub random_seed: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub verbose: Option<bool>,
    pub repeat: Option<u32>,
    pub randomise: Option<bool>,
    pub skip_gui_tests: Option<bool>,
    pub data_file: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub rtcheck_policy: Option<ViolationPolicy>,
}

impl EnvOverlay {
    /// Read the process environment.
    pub fn load() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            strictness_level: parse_u8(&lookup, "STRICTNESS_LEVEL")
                .map(|level| level.clamp(MIN_STRICTNESS, MAX_STRICTNESS)),
            random_seed: parse_u64(&lookup, "RANDOM_SEED"),
            timeout_ms: parse_u64(&lookup, "TIMEOUT_MS").filter(|ms| *ms > 0),
            verbose: parse_bool(&lookup, "VERBOSE"),
            repeat: parse_u32(&lookup, "REPEAT").map(|n| n.max(1)),
            randomise: parse_bool(&lookup, "RANDOMISE"),
            skip_gui_tests: parse_bool(&lookup, "SKIP_GUI_TESTS"),
            data_file: parse_path(&lookup, "DATA_FILE"),
            output_dir: parse_path(&lookup, "OUTPUT_DIR"),
            rtcheck_policy: lookup("RTCHECK_POLICY").and_then(|raw| match raw.parse() {
                Ok(policy) => Some(policy),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring RTCHECK_POLICY");
                    None
                }
            }),
        }
    }
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring invalid environment value");
            None
        }
    }
}

/// Parse a `u8` env var, returning `None` on missing or invalid.
fn parse_u8(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u8> {
    parse_number(lookup, key)
}

/// Parse a `u32` env var, returning `None` on missing or invalid.
fn parse_u32(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u32> {
    parse_number(lookup, key)
}

/// Parse a `u64` env var, returning `None` on missing or invalid.
fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    parse_number(lookup, key)
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<bool> {
    let raw = lookup(key)?;
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => {
            tracing::warn!(key, value = %raw, "ignoring invalid boolean environment value");
            None
        }
    }
}

fn parse_path(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    lookup(key)
        .filter(|raw| !raw.trim().is_empty())
        .map(PathBuf::from)
}
