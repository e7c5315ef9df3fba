//! Per-queue admission state machine.
//!
//! One atomic word per queue encodes everything the drain and submission
//! paths need to coordinate:
//!
//! - bit 0: the **barrier held** flag. Exactly one thread may own it,
//!   and only when the admission count is zero;
//! - bit 1: the **drain lock**. The queue object is assigned to exactly
//!   one drain invocation (this is the consumer-exclusivity flag that
//!   replaces the classic mediator sentinel);
//! - bits 2..: the **admission count** of in-flight non-barrier
//!   continuations, stepped by one slot per admission.
//!
//! All transitions are compare-and-swap loops or single atomic RMW ops;
//! no lock is ever taken on this word.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};

const BARRIER_BIT: u64 = 1 << 0;
const DRAIN_BIT: u64 = 1 << 1;
const SLOT_ONE: u64 = 1 << 2;
const SLOT_SHIFT: u32 = 2;

/// Decoded view of the admission word, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateSnapshot {
    /// Whether the barrier bit is held.
    pub barrier: bool,
    /// Whether a drain invocation owns the queue.
    pub draining: bool,
    /// Number of in-flight non-barrier admissions.
    pub slots: u64,
}

/// The atomic admission word.
#[derive(Debug)]
pub(crate) struct AdmissionState {
    word: CachePadded<AtomicU64>,
}

impl AdmissionState {
    pub(crate) fn new() -> Self {
        Self {
            word: CachePadded::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn snapshot(&self) -> StateSnapshot {
        let word = self.word.load(Ordering::Acquire);
        StateSnapshot {
            barrier: word & BARRIER_BIT != 0,
            draining: word & DRAIN_BIT != 0,
            slots: word >> SLOT_SHIFT,
        }
    }

    /// True when nothing is admitted and no barrier is held.
    ///
    /// The drain lock is deliberately ignored: a queue can be assigned to
    /// a drain invocation while momentarily having nothing admitted.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.word.load(Ordering::Acquire) & !DRAIN_BIT == 0
    }

    /// Attempts to admit one non-barrier continuation under `max_slots`.
    ///
    /// Fails if the barrier bit is held or the count is at the width cap;
    /// the increment is never published in that case (no rollback races).
    pub(crate) fn try_admit(&self, max_slots: u32) -> bool {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            if cur & BARRIER_BIT != 0 || (cur >> SLOT_SHIFT) >= u64::from(max_slots) {
                return false;
            }
            match self.word.compare_exchange_weak(
                cur,
                cur + SLOT_ONE,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Releases one admission slot; returns `true` if the queue became
    /// quiescent (no slots, no barrier).
    pub(crate) fn release_slot(&self) -> bool {
        let prev = self.word.fetch_sub(SLOT_ONE, Ordering::AcqRel);
        debug_assert!(prev >> SLOT_SHIFT > 0, "slot release without admission");
        (prev - SLOT_ONE) & !DRAIN_BIT == 0
    }

    /// Attempts to take the barrier: requires zero in-flight admissions
    /// and no barrier holder.
    pub(crate) fn try_acquire_barrier(&self) -> bool {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            if cur & BARRIER_BIT != 0 || cur >> SLOT_SHIFT != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                cur,
                cur | BARRIER_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drops the barrier bit.
    pub(crate) fn release_barrier(&self) {
        let prev = self.word.fetch_and(!BARRIER_BIT, Ordering::AcqRel);
        debug_assert!(prev & BARRIER_BIT != 0, "barrier release without holder");
    }

    /// Attempts to assign the queue to a drain invocation.
    pub(crate) fn try_lock_drain(&self) -> bool {
        let mut cur = self.word.load(Ordering::Relaxed);
        loop {
            if cur & DRAIN_BIT != 0 {
                return false;
            }
            match self.word.compare_exchange_weak(
                cur,
                cur | DRAIN_BIT,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Releases the drain assignment.
    pub(crate) fn unlock_drain(&self) {
        let prev = self.word.fetch_and(!DRAIN_BIT, Ordering::AcqRel);
        debug_assert!(prev & DRAIN_BIT != 0, "drain unlock without lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn admit_respects_width() {
        let state = AdmissionState::new();
        assert!(state.try_admit(2));
        assert!(state.try_admit(2));
        assert!(!state.try_admit(2));
        assert!(!state.release_slot());
        assert!(state.try_admit(2));
    }

    #[test]
    fn barrier_requires_quiescence() {
        let state = AdmissionState::new();
        assert!(state.try_admit(4));
        assert!(!state.try_acquire_barrier());
        assert!(state.release_slot());
        assert!(state.try_acquire_barrier());
        assert!(!state.try_acquire_barrier());
        assert!(!state.try_admit(4));
        state.release_barrier();
        assert!(state.try_admit(4));
    }

    #[test]
    fn release_reports_quiescence() {
        let state = AdmissionState::new();
        assert!(state.try_admit(8));
        assert!(state.try_admit(8));
        assert!(!state.release_slot());
        assert!(state.release_slot());
        assert!(state.is_quiescent());
    }

    #[test]
    fn drain_lock_is_exclusive_and_orthogonal() {
        let state = AdmissionState::new();
        assert!(state.try_lock_drain());
        assert!(!state.try_lock_drain());
        // Admissions and barriers coexist with the drain lock.
        assert!(state.try_admit(1));
        assert!(state.release_slot());
        assert!(state.try_acquire_barrier());
        state.release_barrier();
        state.unlock_drain();
        assert!(state.try_lock_drain());
        state.unlock_drain();
    }

    #[test]
    fn concurrent_admission_never_exceeds_width() {
        const WIDTH: u32 = 3;
        const THREADS: usize = 8;
        const ROUNDS: usize = 2_000;

        let state = Arc::new(AdmissionState::new());
        let peak = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let state = Arc::clone(&state);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        if state.try_admit(WIDTH) {
                            let now = state.snapshot().slots;
                            peak.fetch_max(now, Ordering::Relaxed);
                            state.release_slot();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("admission thread panicked");
        }

        assert!(peak.load(Ordering::Relaxed) <= u64::from(WIDTH));
        assert!(state.is_quiescent());
    }

    #[test]
    fn barrier_is_exclusive_under_contention() {
        const THREADS: usize = 8;
        const ROUNDS: usize = 2_000;

        let state = Arc::new(AdmissionState::new());
        let holders = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let overlap = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let state = Arc::clone(&state);
                let holders = Arc::clone(&holders);
                let overlap = Arc::clone(&overlap);
                thread::spawn(move || {
                    for _ in 0..ROUNDS {
                        if state.try_acquire_barrier() {
                            let n = holders.fetch_add(1, Ordering::SeqCst) + 1;
                            if n > 1 {
                                overlap.fetch_add(1, Ordering::SeqCst);
                            }
                            holders.fetch_sub(1, Ordering::SeqCst);
                            state.release_barrier();
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("barrier thread panicked");
        }

        assert_eq!(overlap.load(Ordering::SeqCst), 0);
    }
}
