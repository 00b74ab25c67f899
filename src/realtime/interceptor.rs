//! Global allocator hook and thread-scoped allocation permission.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::io::Write;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use super::violations::{AllocKind, ViolationBatch, ViolationRing};
use super::ViolationPolicy;

static INSTALLED: AtomicBool = AtomicBool::new(false);
static POLICY: AtomicU8 = AtomicU8::new(ViolationPolicy::RaiseError.as_u8());
static CURRENT_TEST: AtomicU64 = AtomicU64::new(0);
static NEXT_TEST_TOKEN: AtomicU64 = AtomicU64::new(1);
static NEXT_THREAD_ORDINAL: AtomicU64 = AtomicU64::new(1);
static VIOLATIONS: ViolationRing = ViolationRing::new();

thread_local! {
    static ALLOWED: Cell<bool> = const { Cell::new(true) };
    static THREAD_ORDINAL: Cell<u64> = const { Cell::new(0) };
}

/// `GlobalAlloc` over the system allocator that reports calls made while the
/// current thread is inside a real-time window.
pub struct InterceptingAllocator;

// SAFETY: every method forwards to `System` with the caller's arguments
// unchanged; the added bookkeeping never allocates.
unsafe impl GlobalAlloc for InterceptingAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        check(AllocKind::Alloc, layout.size());
        unsafe { System.alloc(layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        check(AllocKind::AllocZeroed, layout.size());
        unsafe { System.alloc_zeroed(layout) }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        check(AllocKind::Dealloc, layout.size());
        unsafe { System.dealloc(ptr, layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        check(AllocKind::Realloc, new_size);
        unsafe { System.realloc(ptr, layout, new_size) }
    }
}

#[inline]
fn check(kind: AllocKind, size: usize) {
    if !INSTALLED.load(Ordering::Relaxed) {
        return;
    }
    if ALLOWED.try_with(Cell::get).unwrap_or(true) {
        return;
    }

    // Raise the flag while recording so nothing below re-enters the check.
    let _ = ALLOWED.try_with(|flag| flag.set(true));
    VIOLATIONS.push(kind, size, thread_ordinal(), CURRENT_TEST.load(Ordering::Acquire));
    if policy() == ViolationPolicy::Abort {
        abort_on_violation(kind);
    }
    let _ = ALLOWED.try_with(|flag| flag.set(false));
}

fn abort_on_violation(kind: AllocKind) -> ! {
    let mut stderr = std::io::stderr();
    let _ = stderr.write_all(b"plugcheck: allocation inside real-time window (");
    let _ = stderr.write_all(kind.as_str().as_bytes());
    let _ = stderr.write_all(b"), aborting\n");
    std::process::abort()
}

/// Small process-local identifier for the calling thread. Never allocates.
pub fn thread_ordinal() -> u64 {
    THREAD_ORDINAL
        .try_with(|slot| {
            let current = slot.get();
            if current != 0 {
                return current;
            }
            let assigned = NEXT_THREAD_ORDINAL.fetch_add(1, Ordering::Relaxed);
            slot.set(assigned);
            assigned
        })
        .unwrap_or(0)
}

/// Set the calling thread's permission flag, returning the previous value.
pub fn set_allowed_to_allocate(allowed: bool) -> bool {
    ALLOWED.try_with(|flag| flag.replace(allowed)).unwrap_or(true)
}

/// Whether the calling thread may currently allocate.
pub fn is_allowed_to_allocate() -> bool {
    ALLOWED.try_with(Cell::get).unwrap_or(true)
}

/// Scoped real-time window: allocation is disallowed until the guard drops.
///
/// Restores the previous flag on every exit path, including unwinding.
#[must_use = "the window closes as soon as the guard is dropped"]
pub struct RealtimeGuard {
    previous: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for RealtimeGuard {
    fn drop(&mut self) {
        set_allowed_to_allocate(self.previous);
    }
}

/// Open a real-time window on the calling thread.
pub fn realtime_window() -> RealtimeGuard {
    RealtimeGuard {
        previous: set_allowed_to_allocate(false),
        _thread_bound: PhantomData,
    }
}

/// Scoped permission to allocate inside an enclosing real-time window.
#[must_use = "permission is revoked as soon as the guard is dropped"]
pub struct AllocationPermit {
    previous: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for AllocationPermit {
    fn drop(&mut self) {
        set_allowed_to_allocate(self.previous);
    }
}

/// Temporarily allow allocation, e.g. for engine bookkeeping.
pub fn allow_allocations() -> AllocationPermit {
    AllocationPermit {
        previous: set_allowed_to_allocate(true),
        _thread_bound: PhantomData,
    }
}

/// Attribution of violations to the currently executing test.
///
/// Dropping the guard clears the attribution.
pub struct TestAttribution {
    token: u64,
}

impl TestAttribution {
    pub fn token(&self) -> u64 {
        self.token
    }
}

impl Drop for TestAttribution {
    fn drop(&mut self) {
        let _ = CURRENT_TEST.compare_exchange(self.token, 0, Ordering::AcqRel, Ordering::Relaxed);
    }
}

/// Mark the start of a test; violations recorded until the guard drops carry
/// its token.
pub fn begin_test() -> TestAttribution {
    let token = NEXT_TEST_TOKEN.fetch_add(1, Ordering::Relaxed);
    CURRENT_TEST.store(token, Ordering::Release);
    TestAttribution { token }
}

/// Take every violation recorded since the last drain.
pub fn drain_violations() -> ViolationBatch {
    let _permit = allow_allocations();
    VIOLATIONS.drain()
}

/// Process-wide interceptor lifecycle.
///
/// Hooks are pass-through until [`AllocInterceptor::install`] is called.
pub struct AllocInterceptor;

impl AllocInterceptor {
    /// Start checking allocations with the given policy.
    ///
    /// Stale records from before installation are discarded.
    pub fn install(policy: ViolationPolicy) {
        POLICY.store(policy.as_u8(), Ordering::Release);
        let stale = VIOLATIONS.drain();
        if !stale.is_empty() {
            tracing::debug!(count = stale.records.len(), "discarding stale allocation records");
        }
        INSTALLED.store(true, Ordering::Release);
        tracing::debug!(policy = policy.as_str(), "allocation interceptor installed");
    }

    /// Stop checking allocations. Thread flags are left untouched.
    pub fn shutdown() {
        INSTALLED.store(false, Ordering::Release);
    }

    pub fn is_installed() -> bool {
        INSTALLED.load(Ordering::Acquire)
    }
}

/// Currently configured violation policy.
pub fn policy() -> ViolationPolicy {
    ViolationPolicy::from_u8(POLICY.load(Ordering::Acquire))
}
