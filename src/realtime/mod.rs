//! Real-time safety checks.
//!
//! A process-wide allocator hook that detects dynamic memory (de)allocation
//! performed while a thread is inside a real-time window. The window is
//! opened with [`realtime_window`] and closes when the guard drops; outside a
//! window every thread is allowed to allocate.
//!
//! Violations are written to a lock-free ring from inside the hook and
//! drained by the test engine at test boundaries.

mod interceptor;
mod violations;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use interceptor::{
    allow_allocations, begin_test, drain_violations, is_allowed_to_allocate, policy,
    realtime_window, set_allowed_to_allocate, thread_ordinal, AllocInterceptor,
    AllocationPermit, InterceptingAllocator, RealtimeGuard, TestAttribution,
};
pub use violations::{AllocKind, Violation, ViolationBatch, RING_CAPACITY};

/// Response to an allocation inside a real-time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationPolicy {
    /// Record and continue.
    LogOnly,
    /// Record; the engine fails the current test.
    RaiseError,
    /// Record and terminate the process.
    Abort,
}

impl Default for ViolationPolicy {
    fn default() -> Self {
        Self::RaiseError
    }
}

impl ViolationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LogOnly => "log",
            Self::RaiseError => "raise",
            Self::Abort => "abort",
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::LogOnly => 0,
            Self::RaiseError => 1,
            Self::Abort => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::LogOnly,
            2 => Self::Abort,
            _ => Self::RaiseError,
        }
    }

    /// Whether a recorded violation should fail the test it is attributed to.
    pub fn fails_test(&self) -> bool {
        !matches!(self, Self::LogOnly)
    }
}

impl fmt::Display for ViolationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown violation policy: {0} (expected log, raise or abort)")]
pub struct UnknownPolicy(pub String);

impl FromStr for ViolationPolicy {
    type Err = UnknownPolicy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" | "logonly" | "log_only" | "log-only" => Ok(Self::LogOnly),
            "raise" | "raiseerror" | "raise_error" | "raise-error" => Ok(Self::RaiseError),
            "abort" => Ok(Self::Abort),
            _ => Err(UnknownPolicy(s.to_string())),
        }
    }
}

/// Serialises unit tests that install the interceptor or drain the ring.
#[cfg(test)]
pub(crate) static INTERCEPTOR_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::const_mutex(());
