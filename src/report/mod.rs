//! Aggregated results and their renderings.
//!
//! Totals are always computed from the per-test results; nothing is stored
//! twice.

mod junit;
mod text;

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::engine::TestResult;
use crate::supervisor::{SessionOutcome, ValidationEvent};

pub use junit::render_junit;
pub use text::{render_target, render_text};

pub const JUNIT_FILE_NAME: &str = "junit.xml";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("XML error: {0}")]
    Xml(String),
}

/// Results for one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetReport {
    pub target: String,
    /// `None` until the session's terminal event arrives.
    pub outcome: Option<SessionOutcome>,
    pub results: Vec<TestResult>,
    /// Reason carried by an abnormal terminal event.
    pub reason: Option<String>,
}

impl TargetReport {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            outcome: None,
            results: Vec::new(),
            reason: None,
        }
    }

    /// Fold one session event into the report.
    pub fn observe(&mut self, event: &ValidationEvent) {
        match event {
            ValidationEvent::ItemComplete { result, .. } => self.results.push(result.clone()),
            ValidationEvent::AllComplete { .. } => self.outcome = Some(SessionOutcome::Completed),
            ValidationEvent::ConnectionLost { outcome, reason } => {
                self.outcome = Some(*outcome);
                self.reason = Some(reason.clone());
            }
            ValidationEvent::Started { .. } | ValidationEvent::Log(_) => {}
        }
    }

    pub fn tests(&self) -> u32 {
        self.results.len() as u32
    }

    pub fn failures(&self) -> u32 {
        self.results.iter().map(|r| r.failures).sum()
    }

    /// Results with at least one failure.
    pub fn failed_tests(&self) -> u32 {
        self.results.iter().filter(|r| !r.passed()).count() as u32
    }

    pub fn duration_ms(&self) -> u64 {
        self.results.iter().map(TestResult::duration_ms).sum()
    }

    /// File name for this target's text report.
    pub fn file_stem(&self) -> String {
        let stem: String = self
            .target
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        stem.trim_start_matches('.').to_string()
    }
}

/// Results for every target, in run order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregatedReport {
    pub targets: Vec<TargetReport>,
}

impl AggregatedReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: TargetReport) {
        self.targets.push(target);
    }

    pub fn tests(&self) -> u32 {
        self.targets.iter().map(TargetReport::tests).sum()
    }

    pub fn failures(&self) -> u32 {
        self.targets.iter().map(TargetReport::failures).sum()
    }

    pub fn duration_ms(&self) -> u64 {
        self.targets.iter().map(TargetReport::duration_ms).sum()
    }

    /// Process exit code: total failures, capped at 255.
    pub fn exit_code(&self) -> u8 {
        self.failures().min(u8::MAX as u32) as u8
    }

    /// Write `<dir>/<target>.txt` per target and `<dir>/junit.xml`.
    pub fn write_to_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, ReportError> {
        std::fs::create_dir_all(dir).map_err(|source| ReportError::Write {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut written = Vec::with_capacity(self.targets.len() + 1);
        for target in &self.targets {
            let path = dir.join(format!("{}.txt", target.file_stem()));
            write_file(&path, render_target(target).as_bytes())?;
            written.push(path);
        }

        let path = dir.join(JUNIT_FILE_NAME);
        write_file(&path, render_junit(self)?.as_bytes())?;
        written.push(path);
        Ok(written)
    }
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), ReportError> {
    std::fs::write(path, contents).map_err(|source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    })
}
