//! Validates a list of targets one after another.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ValidationOptions;
use crate::plugin::REFERENCE_PREFIX;
use crate::report::{render_text, AggregatedReport, ReportError, TargetReport};
use crate::supervisor::{EventSender, Supervisor, ValidationEvent};

/// Extensions recognised when scanning a directory.
pub const PLUGIN_EXTENSIONS: &[&str] = &["vst3", "component", "clap", "vst", "so", "dylib", "dll"];

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Failed to scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No targets given")]
    NoTargets,

    #[error(transparent)]
    Report(#[from] ReportError),
}

fn is_plugin_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| PLUGIN_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
}

/// Turn command-line targets into the list of things to validate.
///
/// Identifiers and files pass through unchanged. Directories are replaced by
/// the plugins directly inside them, sorted. Bundle directories such as
/// `.vst3` are plugins themselves and are not scanned.
pub fn expand_targets(inputs: &[String]) -> Result<Vec<String>, OrchestratorError> {
    let mut targets = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if input.starts_with(REFERENCE_PREFIX) || !path.is_dir() || is_plugin_path(path) {
            targets.push(input.clone());
            continue;
        }

        let entries = std::fs::read_dir(path).map_err(|source| OrchestratorError::Scan {
            path: path.to_path_buf(),
            source,
        })?;
        let mut found: Vec<String> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| is_plugin_path(p))
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        found.sort();

        if found.is_empty() {
            tracing::warn!(dir = %path.display(), "no plugins found in directory");
        }
        targets.extend(found);
    }

    if targets.is_empty() {
        return Err(OrchestratorError::NoTargets);
    }
    Ok(targets)
}

/// Runs one session per target, strictly in sequence.
pub struct Orchestrator {
    supervisor: Supervisor,
    echo_logs: bool,
}

impl Orchestrator {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            echo_logs: false,
        }
    }

    /// Print session log lines to stdout as they arrive.
    pub fn echo_logs(mut self, echo: bool) -> Self {
        self.echo_logs = echo;
        self
    }

    /// Validate every target. Stops starting new sessions once `cancel`
    /// fires; the interrupted session's results are kept.
    pub async fn run(
        &mut self,
        targets: &[String],
        options: &ValidationOptions,
        cancel: CancellationToken,
    ) -> AggregatedReport {
        let mut report = AggregatedReport::new();
        for target in targets {
            if cancel.is_cancelled() {
                tracing::warn!(remaining = targets.len() - report.targets.len(), "cancelled");
                break;
            }
            tracing::info!(%target, "validating");
            let target_report = self.run_target(target, options, cancel.clone()).await;
            report.push(target_report);
        }
        report
    }

    async fn run_target(
        &mut self,
        target: &str,
        options: &ValidationOptions,
        cancel: CancellationToken,
    ) -> TargetReport {
        let (events, mut rx) = EventSender::channel();
        let echo = self.echo_logs;

        let session = self.supervisor.run_session(target, options, events, cancel);
        let consume = async {
            let mut report = TargetReport::new(target);
            while let Some(event) = rx.recv().await {
                if echo {
                    echo_event(&event);
                }
                report.observe(&event);
            }
            report
        };

        let (outcome, mut report) = tokio::join!(session, consume);
        report.outcome.get_or_insert(outcome);
        report
    }
}

fn echo_event(event: &ValidationEvent) {
    match event {
        ValidationEvent::Log(text) => println!("{text}"),
        ValidationEvent::ConnectionLost { outcome, reason } => {
            println!("*** Session {outcome}: {reason}")
        }
        _ => {}
    }
}

/// Print the text report and write report files if an output directory is set.
pub fn publish(report: &AggregatedReport, options: &ValidationOptions) -> Result<(), OrchestratorError> {
    print!("{}", render_text(report));
    if let Some(dir) = &options.output_dir {
        let written = report.write_to_dir(dir)?;
        tracing::info!(files = written.len(), dir = %dir.display(), "reports written");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifiers_and_files_pass_through() {
        let inputs = vec![
            "reference:gain".to_string(),
            "/does/not/exist.vst3".to_string(),
        ];
        assert_eq!(expand_targets(&inputs).unwrap(), inputs);
    }

    #[test]
    fn directories_are_scanned_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.clap", "a.vst3", "notes.txt", "c.SO"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        std::fs::create_dir(dir.path().join("Bundle.component")).unwrap();
        std::fs::create_dir_all(dir.path().join("nested/d.vst3")).unwrap();

        let targets = expand_targets(&[dir.path().to_string_lossy().into_owned()]).unwrap();
        let names: Vec<_> = targets
            .iter()
            .map(|t| Path::new(t).file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["Bundle.component", "a.vst3", "b.clap", "c.SO"]);
    }

    #[test]
    fn bundle_directory_is_a_target() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = dir.path().join("Synth.vst3");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();
        let input = bundle.to_string_lossy().into_owned();
        assert_eq!(expand_targets(&[input.clone()]).unwrap(), vec![input]);
    }

    #[test]
    fn nothing_to_validate_is_an_error() {
        assert!(matches!(expand_targets(&[]), Err(OrchestratorError::NoTargets)));
        let empty = tempfile::tempdir().unwrap();
        assert!(matches!(
            expand_targets(&[empty.path().to_string_lossy().into_owned()]),
            Err(OrchestratorError::NoTargets)
        ));
    }
}
