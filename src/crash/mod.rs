//! Crash capture for the worker process.
//!
//! Installs fault handlers once per process, before any plugin is loaded.
//! On a fatal signal the handler writes a stack trace to a well-known file
//! and lets the process die; the supervisor reads the file afterwards and
//! attaches it to the test that was running. Nothing here attempts recovery.

#[cfg(unix)]
mod unix;

#[cfg(unix)]
pub use unix::is_fatal_signal;

/// Whether a terminating signal number is one the handler reports.
#[cfg(not(unix))]
pub fn is_fatal_signal(_signal: i32) -> bool {
    false
}

use std::backtrace::Backtrace;
use std::cell::Cell;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::realtime;

/// File name prefix of the trace inside the temp directory.
pub const TRACE_FILE_STEM: &str = "plugcheck_crash_trace";

/// First line written by the fatal signal handler.
pub const SIGNAL_HEADER: &str = "*** Caught fatal signal";
/// First line written by the panic hook.
pub const PANIC_HEADER: &str = "*** Unhandled panic";

static INSTALLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static CATCHING: Cell<bool> = const { Cell::new(false) };
}

#[derive(Debug, Error)]
pub enum CrashError {
    #[error("Failed to open crash trace file {path}: {source}")]
    TraceFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to install handler for {signal}: {source}")]
    Signal {
        signal: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Crash trace location for this controller. Named after the controller's
/// pid so concurrent runs on one host never read each other's traces.
pub fn default_trace_path() -> PathBuf {
    std::env::temp_dir().join(format!("{TRACE_FILE_STEM}_{}.txt", std::process::id()))
}

/// Process-wide crash handler.
pub struct CrashHandler;

impl CrashHandler {
    /// Install signal handlers and the panic hook. Later calls are no-ops.
    pub fn install(trace_path: &Path) -> Result<(), CrashError> {
        if INSTALLED.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        #[cfg(unix)]
        if let Err(e) = unix::install(trace_path) {
            INSTALLED.store(false, Ordering::Release);
            return Err(e);
        }

        install_panic_hook(trace_path.to_path_buf());
        tracing::debug!(path = %trace_path.display(), "crash handler installed");
        Ok(())
    }

    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::Acquire)
    }
}

/// Scope in which a panic is expected to be caught by the engine.
///
/// Panics raised inside the scope are reported as test failures and do not
/// write the crash trace.
pub struct CatchScope {
    previous: bool,
}

impl Drop for CatchScope {
    fn drop(&mut self) {
        let previous = self.previous;
        let _ = CATCHING.try_with(|flag| flag.set(previous));
    }
}

pub fn catching_unwind() -> CatchScope {
    let previous = CATCHING.try_with(|flag| flag.replace(true)).unwrap_or(false);
    CatchScope { previous }
}

fn install_panic_hook(trace_path: PathBuf) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let _permit = realtime::allow_allocations();
        let caught = CATCHING.try_with(Cell::get).unwrap_or(false);
        if !caught {
            let text = format!(
                "{PANIC_HEADER}: {}\n{}\n",
                info,
                Backtrace::force_capture()
            );
            let _ = append_note(&trace_path, &text);
        }
        previous(info);
    }));
}

/// Truncate (or create) the trace file so a new session starts clean.
pub fn clear_trace(path: &Path) -> io::Result<()> {
    fs::File::create(path)?;
    Ok(())
}

/// Read the trace if one was written.
pub fn read_trace(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Whether trace text records an actual crash rather than only notes.
pub fn contains_crash(trace: &str) -> bool {
    trace.contains(SIGNAL_HEADER) || trace.contains(PANIC_HEADER)
}

/// Append a line to the trace file. Used for session-level notes such as
/// allocation violations that happened outside any test.
pub fn append_note(path: &Path, note: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(note.as_bytes())?;
    if !note.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}
