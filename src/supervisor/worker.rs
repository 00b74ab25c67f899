//! Worker side of an out-of-process session.
//!
//! The worker owns the plugin. It reports over its original stdout using
//! the line protocol; anything else (plugin prints, logs) goes to stderr.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::protocol::{encode_item_complete, encode_line, ProtocolError, WorkerMessage};
use super::SupervisorError;
use crate::config::ValidationOptions;
use crate::crash::CrashHandler;
use crate::engine::{EngineConfig, EngineListener, SessionSummary, TestEngine, TestResult};
use crate::plugin::FormatManager;
use crate::realtime::{allow_allocations, AllocInterceptor};
use crate::suite::TestRegistry;

/// Arguments the supervisor passes to a worker.
#[derive(Debug, Clone)]
pub struct WorkerArgs {
    pub target: String,
    /// Serialised [`ValidationOptions`].
    pub options: String,
    pub crash_trace: PathBuf,
    pub settle_ms: u64,
}

/// Serialised writer for protocol lines.
pub struct IpcWriter {
    out: Mutex<BufWriter<Box<dyn Write + Send>>>,
}

impl IpcWriter {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(BufWriter::new(out)),
        }
    }

    /// Claim stdout for the protocol and point fd 1 at stderr, so stray
    /// prints from the plugin cannot corrupt the stream.
    #[cfg(unix)]
    pub fn claim_stdout() -> Result<Self, ProtocolError> {
        use std::os::fd::FromRawFd;

        std::io::stdout().flush()?;
        // SAFETY: dup/dup2 on the process's own standard descriptors.
        let ipc_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
        if ipc_fd < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(ipc_fd) };
            return Err(err.into());
        }
        // SAFETY: ipc_fd is a fresh descriptor owned by nothing else.
        let file = unsafe { File::from_raw_fd(ipc_fd) };
        Ok(Self::new(Box::new(file)))
    }

    #[cfg(not(unix))]
    pub fn claim_stdout() -> Result<Self, ProtocolError> {
        Ok(Self::new(Box::new(std::io::stdout())))
    }

    pub fn send(&self, message: &WorkerMessage) -> Result<(), ProtocolError> {
        let _permit = allow_allocations();
        let line = encode_line(message)?;
        self.write_line(&line)
    }

    /// Send a test result, truncating its output if it would not fit.
    pub fn send_result(&self, result: &TestResult) -> Result<(), ProtocolError> {
        let _permit = allow_allocations();
        let line = encode_item_complete(result)?;
        self.write_line(&line)
    }

    fn write_line(&self, line: &str) -> Result<(), ProtocolError> {
        let mut out = self.out.lock();
        out.write_all(line.as_bytes())?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

/// Reports engine progress to the supervisor. The first failed send is
/// kept, and fails the session once the engine returns.
struct WorkerListener {
    writer: Arc<IpcWriter>,
    error: Mutex<Option<ProtocolError>>,
}

impl WorkerListener {
    fn new(writer: Arc<IpcWriter>) -> Self {
        Self {
            writer,
            error: Mutex::new(None),
        }
    }

    fn record(&self, sent: Result<(), ProtocolError>) {
        if let Err(e) = sent {
            let _permit = allow_allocations();
            tracing::error!(error = %e, "failed to report to supervisor");
            self.error.lock().get_or_insert(e);
        }
    }

    fn take_error(&self) -> Option<ProtocolError> {
        self.error.lock().take()
    }
}

impl EngineListener for WorkerListener {
    fn log(&self, text: &str) {
        self.record(self.writer.send(&WorkerMessage::Log {
            text: text.to_string(),
        }));
    }

    fn item_complete(&self, result: &TestResult) {
        self.record(self.writer.send_result(result));
    }
}

/// Validate `args.target`, reporting to `writer`.
pub fn run_worker(
    args: &WorkerArgs,
    writer: Arc<IpcWriter>,
    formats: Arc<FormatManager>,
    registry: &TestRegistry,
) -> Result<SessionSummary, SupervisorError> {
    CrashHandler::install(&args.crash_trace)?;
    let options = ValidationOptions::from_payload(&args.options)?;

    tracing::debug!(
        target_path = %args.target,
        policy = options.violation_policy.as_str(),
        "worker starting"
    );
    AllocInterceptor::install(options.violation_policy);

    let config = EngineConfig {
        settle_delay: Duration::from_millis(args.settle_ms),
        ..EngineConfig::default()
    };
    let listener = Arc::new(WorkerListener::new(writer.clone()));
    let result = TestEngine::new(formats, registry)
        .with_config(config)
        .with_crash_trace(args.crash_trace.clone())
        .run(&args.target, &options, listener.clone());

    let result = match (result, listener.take_error()) {
        (Err(e), _) => Err(e.into()),
        // Results went missing; exit without a terminal message.
        (Ok(_), Some(e)) => Err(e.into()),
        (Ok(summary), None) => writer
            .send(&WorkerMessage::AllComplete {
                tests: summary.tests,
                failures: summary.failures,
                seed: summary.seed,
            })
            .map(|()| summary)
            .map_err(SupervisorError::from),
    };
    AllocInterceptor::shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shared buffer so tests can inspect what was written.
    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn writer_emits_one_line_per_message() {
        let sink = Sink::default();
        let writer = IpcWriter::new(Box::new(sink.clone()));
        writer
            .send(&WorkerMessage::Log {
                text: "a\nb".into(),
            })
            .unwrap();
        writer
            .send(&WorkerMessage::AllComplete {
                tests: 1,
                failures: 0,
                seed: 2,
            })
            .unwrap();

        let written = String::from_utf8(sink.0.lock().clone()).unwrap();
        let lines: Vec<_> = written.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("all_complete"));
    }

    #[test]
    fn listener_forwards_results() {
        let sink = Sink::default();
        let listener = WorkerListener::new(Arc::new(IpcWriter::new(Box::new(sink.clone()))));
        listener.item_complete(&TestResult::failure("Editor", "no editor"));
        assert!(listener.take_error().is_none());

        let written = String::from_utf8(sink.0.lock().clone()).unwrap();
        let message = super::super::protocol::decode_line(written.trim_end()).unwrap();
        match message {
            WorkerMessage::ItemComplete { name, failures, .. } => {
                assert_eq!(name, "Editor");
                assert_eq!(failures, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn oversized_result_reaches_supervisor_truncated() {
        let sink = Sink::default();
        let listener = WorkerListener::new(Arc::new(IpcWriter::new(Box::new(sink.clone()))));
        let mut result = TestResult::failure("Audio processing", "Non-finite output in block 0");
        result.output = (0..70_000).map(|i| format!("{i:0>64}")).collect();

        listener.item_complete(&result);
        assert!(listener.take_error().is_none());

        let written = String::from_utf8(sink.0.lock().clone()).unwrap();
        match super::super::protocol::decode_line(written.trim_end()).unwrap() {
            WorkerMessage::ItemComplete {
                failures,
                result: decoded,
                ..
            } => {
                assert_eq!(failures, 1);
                assert_eq!(decoded.messages, result.messages);
                assert!(decoded.output.last().unwrap().ends_with("output lines truncated]"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn failed_send_is_kept_for_the_session() {
        let sink = Sink::default();
        let listener = WorkerListener::new(Arc::new(IpcWriter::new(Box::new(sink.clone()))));
        let mut result = TestResult::started("Plugin state");
        result.add_failure("x".repeat(super::super::protocol::MAX_LINE_SIZE));

        listener.item_complete(&result);
        listener.log("later line");
        assert!(matches!(
            listener.take_error(),
            Some(ProtocolError::MessageTooLarge { .. })
        ));
        let written = String::from_utf8(sink.0.lock().clone()).unwrap();
        assert_eq!(written.lines().count(), 1);
    }
}
