//! Core types shared across the queue engine.
//!
//! These are small, copyable value types: queue identifiers, the queue
//! width model, quality-of-service classes for root queues, and the
//! bit-packed flag word carried by every continuation.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-global counter backing [`QueueId`] allocation.
static NEXT_QUEUE_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a queue.
///
/// Ids are allocated from a process-global counter and are never reused,
/// so they are safe to compare across the lifetime of the process (the
/// self-deadlock detector relies on this).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(u64);

impl QueueId {
    /// Allocates a fresh id.
    pub(crate) fn next() -> Self {
        Self(NEXT_QUEUE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// The concurrency width of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// At most one continuation executes at a time; every continuation
    /// behaves as an implicit barrier.
    Serial,
    /// Up to `n` non-barrier continuations may execute concurrently.
    Concurrent(NonZeroU32),
}

impl Width {
    /// Convenience constructor for a concurrent width.
    ///
    /// # Panics
    ///
    /// Panics if `n` is zero; a zero-width queue could never execute
    /// anything.
    #[must_use]
    pub fn concurrent(n: u32) -> Self {
        Self::Concurrent(NonZeroU32::new(n).expect("queue width must be non-zero"))
    }

    /// Maximum number of simultaneously admitted non-barrier continuations.
    #[must_use]
    pub const fn max_slots(self) -> u32 {
        match self {
            Self::Serial => 1,
            Self::Concurrent(n) => n.get(),
        }
    }

    /// Returns `true` for serial queues.
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial)
    }
}

/// Quality-of-service class of a root queue.
///
/// Higher classes are claimed by pool workers before lower ones. The
/// class is also the default priority inherited by continuations
/// submitted without an explicit override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QosClass {
    /// Maintenance work; claimed last.
    Background,
    /// Long-running work the user is not waiting on.
    Utility,
    /// The default class for queues without an explicit override.
    Default,
    /// Work the user is actively waiting on; claimed first.
    UserInitiated,
}

impl QosClass {
    /// All classes, lowest to highest.
    pub const ALL: [Self; 4] = [
        Self::Background,
        Self::Utility,
        Self::Default,
        Self::UserInitiated,
    ];

    /// Stable index of this class in `0..4`, lowest class first.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Background => 0,
            Self::Utility => 1,
            Self::Default => 2,
            Self::UserInitiated => 3,
        }
    }

    pub(crate) const fn from_index(idx: usize) -> Self {
        match idx {
            0 => Self::Background,
            1 => Self::Utility,
            2 => Self::Default,
            _ => Self::UserInitiated,
        }
    }

    pub(crate) const fn as_u8(self) -> u8 {
        self.index() as u8
    }

    pub(crate) const fn from_u8(v: u8) -> Self {
        Self::from_index(v as usize)
    }
}

impl fmt::Display for QosClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Background => "background",
            Self::Utility => "utility",
            Self::Default => "default",
            Self::UserInitiated => "user-initiated",
        };
        f.write_str(name)
    }
}

/// Bit-packed flag word attached to a continuation.
///
/// Plain bitwise operations over a `u8`; the set of flags is closed so a
/// dedicated bitflags type would add nothing.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct ContinuationFlags(u8);

impl ContinuationFlags {
    /// Requires exclusive access to the queue.
    pub const BARRIER: Self = Self(1 << 0);
    /// A blocked synchronous caller is waiting on this item's gate.
    pub const SLOW_SYNC: Self = Self(1 << 1);
    /// Submitted through a group (`leave` is owed after execution).
    pub const GROUP: Self = Self(1 << 2);
    /// Already deferred once by an admission failure.
    pub const DEFERRED: Self = Self(1 << 3);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for ContinuationFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::BARRIER) {
            names.push("BARRIER");
        }
        if self.contains(Self::SLOW_SYNC) {
            names.push("SLOW_SYNC");
        }
        if self.contains(Self::GROUP) {
            names.push("GROUP");
        }
        if self.contains(Self::DEFERRED) {
            names.push("DEFERRED");
        }
        write!(f, "ContinuationFlags({})", names.join("|"))
    }
}
