//! POSIX fault capture.
//!
//! The handler runs on an alternate stack and uses only stack storage and
//! raw `write(2)` calls, so it is safe even when the heap is corrupt or the
//! allocator interceptor is in abort mode.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void};

use super::CrashError;

static TRACE_FD: AtomicI32 = AtomicI32::new(-1);

const ALT_STACK_SIZE: usize = 64 * 1024;
const MAX_FRAMES: usize = 128;

const FATAL_SIGNALS: [(c_int, &str); 5] = [
    (libc::SIGSEGV, "SIGSEGV"),
    (libc::SIGBUS, "SIGBUS"),
    (libc::SIGILL, "SIGILL"),
    (libc::SIGFPE, "SIGFPE"),
    (libc::SIGABRT, "SIGABRT"),
];

#[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos"))]
mod execinfo {
    use libc::{c_int, c_void};

    extern "C" {
        pub fn backtrace(buffer: *mut *mut c_void, size: c_int) -> c_int;
        pub fn backtrace_symbols_fd(buffer: *const *mut c_void, size: c_int, fd: c_int);
    }
}

pub(super) fn install(trace_path: &Path) -> Result<(), CrashError> {
    let c_path = CString::new(trace_path.as_os_str().as_bytes()).map_err(|_| {
        CrashError::TraceFile {
            path: trace_path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"),
        }
    })?;

    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let fd = unsafe {
        libc::open(
            c_path.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND | libc::O_CLOEXEC,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(CrashError::TraceFile {
            path: trace_path.to_path_buf(),
            source: io::Error::last_os_error(),
        });
    }
    let old = TRACE_FD.swap(fd, Ordering::AcqRel);
    if old >= 0 {
        // SAFETY: old was opened by a previous install and is no longer published.
        unsafe { libc::close(old) };
    }

    install_alt_stack();
    warm_backtrace();

    for (signal, name) in FATAL_SIGNALS {
        // SAFETY: sigaction is zero-initialisable; the handler has the
        // SA_SIGINFO signature and only touches async-signal-safe calls.
        let rc = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_fatal_signal as *const () as usize;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK | libc::SA_RESETHAND;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(signal, &action, std::ptr::null_mut())
        };
        if rc != 0 {
            return Err(CrashError::Signal {
                signal: name,
                source: io::Error::last_os_error(),
            });
        }
    }

    Ok(())
}

/// Give the installing thread a dedicated signal stack so stack overflows
/// can still be reported.
fn install_alt_stack() {
    let stack: &'static mut [u8] = Box::leak(vec![0u8; ALT_STACK_SIZE].into_boxed_slice());
    let ss = libc::stack_t {
        ss_sp: stack.as_mut_ptr() as *mut c_void,
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // SAFETY: the stack is leaked and therefore valid for the process lifetime.
    unsafe {
        libc::sigaltstack(&ss, std::ptr::null_mut());
    }
}

/// The first `backtrace()` call may load the unwinder and allocate; do it
/// now rather than inside the handler.
#[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos"))]
fn warm_backtrace() {
    let mut frames = [std::ptr::null_mut::<c_void>(); 4];
    // SAFETY: frames has room for the requested count.
    unsafe {
        execinfo::backtrace(frames.as_mut_ptr(), frames.len() as c_int);
    }
}

#[cfg(not(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos")))]
fn warm_backtrace() {}

extern "C" fn handle_fatal_signal(signal: c_int, _info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    let fd = TRACE_FD.load(Ordering::Acquire);
    if fd >= 0 {
        let mut digits = [0u8; 20];
        write_all(fd, super::SIGNAL_HEADER.as_bytes());
        write_all(fd, b" ");
        write_all(fd, signal_name(signal).as_bytes());
        write_all(fd, b" (");
        write_all(fd, format_decimal(signal as u64, &mut digits));
        write_all(fd, b") ***\n");
        write_backtrace(fd);
        // SAFETY: fsync is async-signal-safe.
        unsafe { libc::fsync(fd) };
    }

    // SA_RESETHAND restored the default disposition; re-raise to die with it.
    // SAFETY: raise is async-signal-safe.
    unsafe {
        libc::raise(signal);
    }
}

#[cfg(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos"))]
fn write_backtrace(fd: c_int) {
    let mut frames = [std::ptr::null_mut::<c_void>(); MAX_FRAMES];
    // SAFETY: frames is a stack buffer of MAX_FRAMES entries.
    let count = unsafe { execinfo::backtrace(frames.as_mut_ptr(), MAX_FRAMES as c_int) };
    if count > 0 {
        // SAFETY: the first `count` entries were filled by backtrace().
        unsafe { execinfo::backtrace_symbols_fd(frames.as_ptr(), count, fd) };
    } else {
        write_all(fd, b"(no frames captured)\n");
    }
}

#[cfg(not(any(all(target_os = "linux", target_env = "gnu"), target_os = "macos")))]
fn write_backtrace(fd: c_int) {
    write_all(fd, b"(stack trace unavailable on this platform)\n");
}

fn write_all(fd: c_int, mut bytes: &[u8]) {
    while !bytes.is_empty() {
        // SAFETY: bytes points to initialised memory of the given length.
        let written = unsafe { libc::write(fd, bytes.as_ptr() as *const c_void, bytes.len()) };
        if written < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        if written == 0 {
            return;
        }
        bytes = &bytes[written as usize..];
    }
}

fn format_decimal(mut value: u64, buf: &mut [u8; 20]) -> &[u8] {
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    &buf[pos..]
}

fn signal_name(signal: c_int) -> &'static str {
    FATAL_SIGNALS
        .iter()
        .find(|(candidate, _)| *candidate == signal)
        .map(|(_, name)| *name)
        .unwrap_or("UNKNOWN")
}

/// Whether a terminating signal number is one the handler reports.
pub fn is_fatal_signal(signal: i32) -> bool {
    FATAL_SIGNALS.iter().any(|(candidate, _)| *candidate == signal)
}
