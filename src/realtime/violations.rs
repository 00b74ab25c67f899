//! Fixed-capacity violation ring written from inside the allocator hook.
//!
//! Writers never allocate: a ticket is claimed with one `fetch_add`, the slot
//! fields are stored, and the slot sequence is published last. Readers drain
//! under a mutex that owns the read cursor.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of violations retained between drains.
pub const RING_CAPACITY: usize = 1024;

/// Which allocator entry point fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocKind {
    Alloc,
    AllocZeroed,
    Realloc,
    Dealloc,
}

impl AllocKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alloc => "alloc",
            Self::AllocZeroed => "alloc_zeroed",
            Self::Realloc => "realloc",
            Self::Dealloc => "dealloc",
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::Alloc => 0,
            Self::AllocZeroed => 1,
            Self::Realloc => 2,
            Self::Dealloc => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::AllocZeroed,
            2 => Self::Realloc,
            3 => Self::Dealloc,
            _ => Self::Alloc,
        }
    }
}

/// A single (de)allocation observed inside a real-time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: AllocKind,
    /// Requested size in bytes (new size for `realloc`).
    pub size: usize,
    /// Process-local thread ordinal, see [`super::thread_ordinal`].
    pub thread: u64,
    /// Attribution token of the test that was executing, if any.
    pub test: Option<u64>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes on thread #{}",
            self.kind.as_str(),
            self.size,
            self.thread
        )
    }
}

/// Result of draining the ring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViolationBatch {
    pub records: Vec<Violation>,
    /// Records overwritten before they could be drained.
    pub dropped: u64,
}

impl ViolationBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.dropped == 0
    }

    /// Split into records attributed to `token` and records with no test.
    ///
    /// Records carrying a different token belong to a test that already
    /// finished; they are treated as unattributed.
    pub fn partition(self, token: u64) -> (Vec<Violation>, Vec<Violation>) {
        self.records
            .into_iter()
            .partition(|v| v.test == Some(token))
    }
}

struct Slot {
    seq: AtomicU64,
    kind: AtomicU8,
    size: AtomicUsize,
    thread: AtomicU64,
    test: AtomicU64,
}

impl Slot {
    const fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            kind: AtomicU8::new(0),
            size: AtomicUsize::new(0),
            thread: AtomicU64::new(0),
            test: AtomicU64::new(0),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot::new();

pub(crate) struct ViolationRing {
    slots: [Slot; RING_CAPACITY],
    head: AtomicU64,
    read_cursor: Mutex<u64>,
}

impl ViolationRing {
    pub(crate) const fn new() -> Self {
        Self {
            slots: [EMPTY_SLOT; RING_CAPACITY],
            head: AtomicU64::new(0),
            read_cursor: parking_lot::const_mutex(0),
        }
    }

    /// Record a violation. Must not allocate.
    pub(crate) fn push(&self, kind: AllocKind, size: usize, thread: u64, test: u64) {
        let ticket = self.head.fetch_add(1, Ordering::AcqRel);
        let slot = &self.slots[(ticket % RING_CAPACITY as u64) as usize];
        slot.kind.store(kind.as_u8(), Ordering::Relaxed);
        slot.size.store(size, Ordering::Relaxed);
        slot.thread.store(thread, Ordering::Relaxed);
        slot.test.store(test, Ordering::Relaxed);
        slot.seq.store(ticket + 1, Ordering::Release);
    }

    /// Take every published record since the last drain.
    ///
    /// The caller must be allowed to allocate.
    pub(crate) fn drain(&self) -> ViolationBatch {
        let mut cursor = self.read_cursor.lock();
        let head = self.head.load(Ordering::Acquire);
        let mut batch = ViolationBatch::default();

        let capacity = RING_CAPACITY as u64;
        if head.saturating_sub(*cursor) > capacity {
            batch.dropped += head - *cursor - capacity;
            *cursor = head - capacity;
        }

        batch.records.reserve((head - *cursor) as usize);
        while *cursor < head {
            let slot = &self.slots[(*cursor % capacity) as usize];
            let seq = slot.seq.load(Ordering::Acquire);
            if seq < *cursor + 1 {
                // Ticket claimed but not yet published; pick it up next drain.
                break;
            }
            if seq > *cursor + 1 {
                batch.dropped += 1;
                *cursor += 1;
                continue;
            }
            let test = slot.test.load(Ordering::Relaxed);
            batch.records.push(Violation {
                kind: AllocKind::from_u8(slot.kind.load(Ordering::Relaxed)),
                size: slot.size.load(Ordering::Relaxed),
                thread: slot.thread.load(Ordering::Relaxed),
                test: (test != 0).then_some(test),
            });
            *cursor += 1;
        }

        batch
    }
}
