//! Events produced by a validation session.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::engine::TestResult;

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    Completed,
    Disconnected,
    Crashed,
    TimedOut,
    Cancelled,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Crashed => "crashed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationEvent {
    Started {
        target: String,
        /// Worker process id; `None` in-process.
        worker_pid: Option<u32>,
    },
    Log(String),
    ItemComplete {
        name: String,
        failures: u32,
        result: TestResult,
    },
    /// Terminal: the session completed normally.
    AllComplete {
        tests: u32,
        failures: u32,
        seed: u64,
    },
    /// Terminal: the session ended any other way.
    ConnectionLost {
        outcome: SessionOutcome,
        reason: String,
    },
}

impl ValidationEvent {
    pub fn item_complete(result: TestResult) -> Self {
        Self::ItemComplete {
            name: result.name.clone(),
            failures: result.failures,
            result,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AllComplete { .. } | Self::ConnectionLost { .. })
    }

    /// Outcome carried by a terminal event.
    pub fn outcome(&self) -> Option<SessionOutcome> {
        match self {
            Self::AllComplete { .. } => Some(SessionOutcome::Completed),
            Self::ConnectionLost { outcome, .. } => Some(*outcome),
            _ => None,
        }
    }
}

/// Sending half of a session's event stream.
///
/// Delivers at most one terminal event; anything sent after it is dropped.
pub struct EventSender {
    tx: mpsc::UnboundedSender<ValidationEvent>,
    terminated: AtomicBool,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ValidationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                terminated: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Returns false if the event was dropped.
    pub fn send(&self, event: ValidationEvent) -> bool {
        if event.is_terminal() {
            if self.terminated.swap(true, Ordering::AcqRel) {
                return false;
            }
        } else if self.terminated.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}
