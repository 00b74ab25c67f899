//! Out-of-process sessions.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::protocol::{decode_line, WorkerMessage, MAX_LINE_SIZE};
use super::{
    EventSender, InFlight, SessionOutcome, SessionState, SessionStateMachine, SupervisorConfig,
    SupervisorError, ValidationEvent, Watchdog,
};
use crate::config::ValidationOptions;
use crate::crash;

/// Worker stderr lines kept for the failure of an abnormal session.
const STDERR_TAIL_LINES: usize = 20;

/// Why reading the worker's output stopped.
enum StreamEnd {
    Eof,
    Framing(String),
    TimedOut,
    Cancelled,
}

pub(super) async fn run(
    config: &SupervisorConfig,
    state: &mut SessionStateMachine,
    target: &str,
    options: &ValidationOptions,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Result<SessionOutcome, SupervisorError> {
    state.transition(SessionState::Starting)?;

    crash::clear_trace(&config.crash_trace).map_err(|source| SupervisorError::TraceFile {
        path: config.crash_trace.clone(),
        source,
    })?;

    let mut command = Command::new(&config.worker_exe);
    command
        .arg("worker")
        .arg("--target")
        .arg(target)
        .arg("--options")
        .arg(options.to_payload()?)
        .arg("--crash-trace")
        .arg(&config.crash_trace)
        .arg("--settle-ms")
        .arg(config.engine.settle_delay.as_millis().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(source) => {
            state.transition(SessionState::Disconnected)?;
            return Err(SupervisorError::Spawn {
                exe: config.worker_exe.clone(),
                source,
            });
        }
    };
    let worker_pid = child.id();
    tracing::info!(pid = ?worker_pid, "worker started");
    events.send(ValidationEvent::Started {
        target: target.to_string(),
        worker_pid,
    });

    let stderr_tail = child.stderr.take().map(forward_stderr);

    let Some(stdout) = child.stdout.take() else {
        kill(&mut child).await;
        state.transition(SessionState::Disconnected)?;
        events.send(ValidationEvent::ConnectionLost {
            outcome: SessionOutcome::Disconnected,
            reason: "worker stdout unavailable".to_string(),
        });
        return Ok(SessionOutcome::Disconnected);
    };

    state.transition(SessionState::Running)?;

    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_SIZE));
    let mut watchdog = Watchdog::start(options.timeout());
    let mut in_flight = InFlight::default();
    let mut received = Totals::default();
    let mut summary = None;

    let end = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break StreamEnd::Cancelled,
            () = watchdog.expired() => break StreamEnd::TimedOut,
            next = lines.next() => match next {
                Some(Ok(line)) => {
                    watchdog.reset();
                    match decode_line(&line) {
                        Ok(message) => {
                            let totals = forward(message, &mut in_flight, &mut received, events);
                            if totals.is_some() {
                                summary = totals;
                            }
                        }
                        Err(e) => break StreamEnd::Framing(e.to_string()),
                    }
                }
                Some(Err(e)) => break StreamEnd::Framing(e.to_string()),
                None => break StreamEnd::Eof,
            }
        }
    };

    let (outcome, reason) = match end {
        StreamEnd::Cancelled => {
            kill(&mut child).await;
            (SessionOutcome::Cancelled, "Validation cancelled".to_string())
        }
        StreamEnd::TimedOut => {
            kill(&mut child).await;
            let subject = in_flight.name().unwrap_or("Worker").to_string();
            (
                SessionOutcome::TimedOut,
                format!(
                    "{subject} did not respond within {} ms",
                    watchdog.timeout().as_millis()
                ),
            )
        }
        StreamEnd::Framing(error) => {
            kill(&mut child).await;
            (
                SessionOutcome::Disconnected,
                format!("Invalid message from worker: {error}"),
            )
        }
        StreamEnd::Eof => {
            let status = wait_for_exit(&mut child, config.exit_grace).await;
            match classify_exit(status, summary.is_some(), &config.crash_trace, events) {
                (SessionOutcome::Completed, reason) => match summary
                    .and_then(|(tests, failures, _)| received.mismatch(tests, failures))
                {
                    Some(mismatch) => (SessionOutcome::Disconnected, mismatch),
                    None => (SessionOutcome::Completed, reason),
                },
                abnormal => abnormal,
            }
        }
    };

    state.transition(SessionState::from_outcome(outcome))?;
    tracing::info!(outcome = outcome.as_str(), "worker finished");

    match (outcome, summary) {
        (SessionOutcome::Completed, Some((tests, failures, seed))) => {
            events.send(ValidationEvent::AllComplete {
                tests,
                failures,
                seed,
            });
        }
        _ => {
            let mut result = in_flight.take_incomplete(reason.clone());
            if outcome == SessionOutcome::Crashed {
                if let Some(trace) = crash::read_trace(&config.crash_trace) {
                    result.output.extend(trace.lines().map(str::to_string));
                }
            }
            if let Some(task) = stderr_tail {
                result
                    .output
                    .extend(collect_stderr(task).await.into_iter().map(|l| format!("stderr: {l}")));
            }
            events.send(ValidationEvent::item_complete(result));
            events.send(ValidationEvent::ConnectionLost { outcome, reason });
        }
    }

    Ok(outcome)
}

/// Results the supervisor actually received.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Totals {
    tests: u32,
    failures: u32,
}

impl Totals {
    /// Describe a disagreement with the worker's own totals.
    fn mismatch(&self, tests: u32, failures: u32) -> Option<String> {
        (self.tests != tests || self.failures != failures).then(|| {
            format!(
                "Worker reported {tests} tests with {failures} failures but sent {} results with {} failures",
                self.tests, self.failures
            )
        })
    }
}

/// Log worker stderr as it arrives, keeping the last few lines.
fn forward_stderr(stderr: ChildStderr) -> JoinHandle<VecDeque<String>> {
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::warn!(target: "plugcheck::worker", "{line}");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        tail
    })
}

/// The stderr tail of a reaped worker. A descendant still holding the pipe
/// open only costs the grace period.
async fn collect_stderr(task: JoinHandle<VecDeque<String>>) -> VecDeque<String> {
    let abort = task.abort_handle();
    match tokio::time::timeout(Duration::from_secs(1), task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "stderr reader failed");
            VecDeque::new()
        }
        Err(_) => {
            abort.abort();
            VecDeque::new()
        }
    }
}

/// Pass a worker message on as an event. Returns the totals of a terminal
/// message, which is held back until the worker has exited.
fn forward(
    message: WorkerMessage,
    in_flight: &mut InFlight,
    received: &mut Totals,
    events: &EventSender,
) -> Option<(u32, u32, u64)> {
    match message {
        WorkerMessage::Log { text } => {
            in_flight.observe_log(&text);
            events.send(ValidationEvent::Log(text));
            None
        }
        WorkerMessage::ItemComplete {
            name,
            failures,
            result,
        } => {
            in_flight.observe_complete(&name);
            received.tests += 1;
            received.failures += failures;
            events.send(ValidationEvent::ItemComplete {
                name,
                failures,
                result,
            });
            None
        }
        WorkerMessage::AllComplete {
            tests,
            failures,
            seed,
        } => Some((tests, failures, seed)),
    }
}

fn classify_exit(
    status: Option<ExitStatus>,
    saw_terminal: bool,
    trace_path: &std::path::Path,
    events: &EventSender,
) -> (SessionOutcome, String) {
    let trace = crash::read_trace(trace_path);
    let crashed = trace.as_deref().is_some_and(crash::contains_crash);
    let fault = status.and_then(fault_signal);

    if let (Some(notes), false) = (&trace, crashed) {
        for line in notes.lines() {
            events.send(ValidationEvent::Log(line.to_string()));
        }
    }

    let clean = status.is_some_and(|s| s.success());
    if saw_terminal && clean && !crashed {
        return (SessionOutcome::Completed, String::new());
    }

    let described = describe_status(status);
    if crashed || fault.is_some() {
        (SessionOutcome::Crashed, format!("Worker crashed ({described})"))
    } else if saw_terminal {
        (
            SessionOutcome::Disconnected,
            format!("Worker exited abnormally after completing ({described})"),
        )
    } else {
        (
            SessionOutcome::Disconnected,
            format!("Worker exited without completing ({described})"),
        )
    }
}

/// Wait for the worker to exit on its own, killing it after `grace`.
async fn wait_for_exit(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "failed to wait for worker");
            None
        }
        Err(_) => {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "worker did not exit; killing");
            kill(child).await
        }
    }
}

/// Forcibly terminate and reap the worker.
async fn kill(child: &mut Child) -> Option<ExitStatus> {
    if let Err(e) = child.start_kill() {
        tracing::debug!(error = %e, "kill failed; worker probably exited");
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap worker");
            None
        }
    }
}

#[cfg(unix)]
fn terminating_signal(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn terminating_signal(_status: ExitStatus) -> Option<i32> {
    None
}

fn fault_signal(status: ExitStatus) -> Option<i32> {
    terminating_signal(status).filter(|signal| crash::is_fatal_signal(*signal))
}

fn describe_status(status: Option<ExitStatus>) -> String {
    match status {
        None => "exit status unknown".to_string(),
        Some(status) => match (terminating_signal(status), status.code()) {
            (Some(signal), _) => format!("signal {signal}"),
            (None, Some(code)) => format!("exit code {code}"),
            (None, None) => "exit status unknown".to_string(),
        },
    }
}
