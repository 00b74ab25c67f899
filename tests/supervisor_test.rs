//! End-to-end sessions against real worker processes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use plugcheck::config::ValidationOptions;
use plugcheck::suite::TestRegistry;
use plugcheck::supervisor::{
    EventSender, ExecutionMode, SessionOutcome, SessionState, Supervisor, SupervisorConfig,
    ValidationEvent,
};

fn config(trace_dir: &tempfile::TempDir) -> SupervisorConfig {
    let registry = Arc::new(TestRegistry::builtin().unwrap());
    let mut config = SupervisorConfig::new(registry).unwrap();
    config.worker_exe = PathBuf::from(env!("CARGO_BIN_EXE_plugcheck"));
    config.crash_trace = trace_dir.path().join("crash_trace.txt");
    config.engine.settle_delay = Duration::from_millis(10);
    config
}

fn options(timeout_ms: u64) -> ValidationOptions {
    ValidationOptions {
        random_seed: 99,
        timeout_ms,
        ..ValidationOptions::default()
    }
}

fn drain(rx: &mut UnboundedReceiver<ValidationEvent>) -> Vec<ValidationEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn run(
    config: SupervisorConfig,
    target: &str,
    options: &ValidationOptions,
) -> (SessionOutcome, Vec<ValidationEvent>) {
    let mut supervisor = Supervisor::new(config);
    let (events, mut rx) = EventSender::channel();
    let outcome = supervisor
        .run_session(target, options, events, CancellationToken::new())
        .await;
    assert_eq!(supervisor.state(), SessionState::Idle);
    (outcome, drain(&mut rx))
}

/// The worker announced in `Started` no longer exists.
#[cfg(unix)]
fn assert_worker_reaped(events: &[ValidationEvent]) {
    let pid = events
        .iter()
        .find_map(|event| match event {
            ValidationEvent::Started { worker_pid, .. } => *worker_pid,
            _ => None,
        })
        .expect("no worker pid");
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    assert_eq!(rc, -1, "worker {pid} still exists");
    assert_eq!(
        std::io::Error::last_os_error().raw_os_error(),
        Some(libc::ESRCH)
    );
}

/// A shell script standing in for the worker executable.
#[cfg(unix)]
fn script_worker(dir: &tempfile::TempDir, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.path().join("worker.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn assert_single_terminal(events: &[ValidationEvent]) {
    assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    assert!(events.last().is_some_and(ValidationEvent::is_terminal));
}

fn last_result(events: &[ValidationEvent]) -> &plugcheck::TestResult {
    events
        .iter()
        .rev()
        .find_map(|event| match event {
            ValidationEvent::ItemComplete { result, .. } => Some(result),
            _ => None,
        })
        .expect("no results")
}

#[tokio::test]
async fn gain_session_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, events) = run(config(&dir), "reference:gain", &options(10_000)).await;

    assert_eq!(outcome, SessionOutcome::Completed);
    assert_single_terminal(&events);
    assert!(matches!(
        events.first(),
        Some(ValidationEvent::Started { worker_pid: Some(_), .. })
    ));
    match events.last() {
        Some(ValidationEvent::AllComplete { failures, seed, tests }) => {
            assert_eq!(*failures, 0);
            assert_eq!(*seed, 99);
            let results = events
                .iter()
                .filter(|e| matches!(e, ValidationEvent::ItemComplete { .. }))
                .count();
            assert_eq!(*tests as usize, results);
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[tokio::test]
async fn hanging_plugin_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let (outcome, events) = run(config(&dir), "reference:hang", &options(1_500)).await;

    assert_eq!(outcome, SessionOutcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_single_terminal(&events);

    let result = last_result(&events);
    assert_eq!(result.name, "Audio processing");
    assert!(result.incomplete);
    assert!(result.messages[0].contains("did not respond within 1500 ms"));
    #[cfg(unix)]
    assert_worker_reaped(&events);
}

#[cfg(unix)]
#[tokio::test]
async fn steady_output_never_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.worker_exe = script_worker(
        &dir,
        r#"for i in 1 2 3 4 5 6; do
  echo '{"kind":"log","text":"tick"}'
  sleep 0.4
done
echo '{"kind":"all_complete","tests":0,"failures":0,"seed":1}'"#,
    );

    let started = Instant::now();
    let (outcome, events) = run(config, "reference:gain", &options(1_000)).await;

    assert_eq!(outcome, SessionOutcome::Completed, "{events:?}");
    assert!(started.elapsed() > Duration::from_millis(2_000));
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, ValidationEvent::Log(text) if text == "tick"))
            .count(),
        6
    );
    assert_single_terminal(&events);
}

#[cfg(unix)]
#[tokio::test]
async fn missing_results_fail_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.worker_exe = script_worker(
        &dir,
        r#"echo '{"kind":"all_complete","tests":1,"failures":1,"seed":1}'"#,
    );

    let (outcome, events) = run(config, "reference:gain", &options(10_000)).await;

    assert_eq!(outcome, SessionOutcome::Disconnected);
    assert_single_terminal(&events);
    let result = last_result(&events);
    assert_eq!(result.name, plugcheck::supervisor::SESSION_ITEM);
    assert!(result.incomplete);
    assert!(result.failures > 0);
    match events.last() {
        Some(ValidationEvent::ConnectionLost { reason, .. }) => {
            assert!(reason.contains("reported 1 tests with 1 failures"), "{reason}");
            assert!(reason.contains("sent 0 results"), "{reason}");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn worker_stderr_is_attached_on_abnormal_exit() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.worker_exe = script_worker(&dir, "echo 'plugin said goodbye' >&2\nexit 4");

    let (outcome, events) = run(config, "reference:gain", &options(10_000)).await;

    assert_eq!(outcome, SessionOutcome::Disconnected);
    let result = last_result(&events);
    assert!(
        result.output.iter().any(|l| l == "stderr: plugin said goodbye"),
        "{:?}",
        result.output
    );
}

#[cfg(unix)]
#[tokio::test]
async fn crashing_plugin_is_reported_with_trace() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, events) = run(config(&dir), "reference:crash", &options(10_000)).await;

    assert_eq!(outcome, SessionOutcome::Crashed);
    assert_single_terminal(&events);
    let result = last_result(&events);
    assert_eq!(result.name, "Audio processing");
    assert!(result.failures > 0);
    assert!(
        result.output.iter().any(|l| l.contains("Caught fatal signal")),
        "{:?}",
        result.output
    );
}

#[tokio::test]
async fn exiting_plugin_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let (outcome, events) = run(config(&dir), "reference:exit", &options(10_000)).await;

    assert_eq!(outcome, SessionOutcome::Disconnected);
    assert_single_terminal(&events);
    match events.last() {
        Some(ValidationEvent::ConnectionLost { reason, .. }) => {
            assert!(reason.contains("exit code 3"), "{reason}");
        }
        other => panic!("unexpected terminal event {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test]
async fn abort_policy_kills_worker_on_violation() {
    let dir = tempfile::tempdir().unwrap();
    let options = ValidationOptions {
        strictness_level: 10,
        violation_policy: plugcheck::realtime::ViolationPolicy::Abort,
        ..options(10_000)
    };
    let (outcome, events) = run(config(&dir), "reference:alloc", &options).await;

    assert_eq!(outcome, SessionOutcome::Crashed);
    assert_single_terminal(&events);
    assert!(last_result(&events).incomplete);
}

#[cfg(unix)]
#[tokio::test]
async fn externally_killed_worker_fails_session() {
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = Supervisor::new(config(&dir));
    let (events, mut rx) = EventSender::channel();
    let options = options(60_000);

    let session = tokio::spawn(async move {
        supervisor
            .run_session("reference:hang", &options, events, CancellationToken::new())
            .await
    });

    let pid = loop {
        match rx.recv().await {
            Some(ValidationEvent::Started {
                worker_pid: Some(pid),
                ..
            }) => break pid,
            Some(_) => continue,
            None => panic!("session ended before starting"),
        }
    };
    // Let the worker get into its first test.
    tokio::time::sleep(Duration::from_millis(300)).await;
    unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };

    let outcome = session.await.unwrap();
    assert!(
        matches!(outcome, SessionOutcome::Disconnected | SessionOutcome::Crashed),
        "{outcome:?}"
    );
    let events = drain(&mut rx);
    assert_single_terminal(&events);
    assert!(last_result(&events).failures > 0);
}

#[tokio::test]
async fn cancellation_stops_worker_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let mut supervisor = Supervisor::new(config(&dir));
    let (events, mut rx) = EventSender::channel();
    let cancel = CancellationToken::new();
    let options = options(60_000);

    let token = cancel.clone();
    let session = tokio::spawn(async move {
        supervisor
            .run_session("reference:hang", &options, events, token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();
    let outcome = session.await.unwrap();

    assert_eq!(outcome, SessionOutcome::Cancelled);
    assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    let events = drain(&mut rx);
    assert_single_terminal(&events);
    assert!(last_result(&events).incomplete);
    #[cfg(unix)]
    assert_worker_reaped(&events);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn in_process_session_completes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.mode = ExecutionMode::InProcess;

    let (outcome, events) = run(config, "reference:gain", &options(10_000)).await;
    assert_eq!(outcome, SessionOutcome::Completed);
    assert_single_terminal(&events);
    assert!(matches!(
        events.first(),
        Some(ValidationEvent::Started { worker_pid: None, .. })
    ));
}

#[tokio::test]
async fn missing_worker_executable_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(&dir);
    config.worker_exe = dir.path().join("no-such-worker");

    let (outcome, events) = run(config, "reference:gain", &options(10_000)).await;
    assert_eq!(outcome, SessionOutcome::Disconnected);
    assert_single_terminal(&events);
    assert_eq!(last_result(&events).name, plugcheck::supervisor::SESSION_ITEM);
}
