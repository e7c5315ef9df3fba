//! Synchronous submission and the lock-transfer protocol.
//!
//! `submit_sync` never has "enqueue and separately wait" semantics: the
//! closure always runs on the calling thread. Either the caller acquires
//! admission immediately (fast path, no handoff), or it enqueues a gate
//! continuation and blocks; the worker that drains the gate acquires the
//! admission *on the caller's behalf* and signals it instead of running
//! anything. Because the closure never crosses threads it needs neither
//! `Send` nor `'static`, and its panics propagate to the caller.
//!
//! Blocked synchronous callers are served strictly FIFO with respect to
//! everything else on the queue: the gate occupies an ordinary list
//! slot.
//!
//! Self-deadlock: submitting synchronously to any queue the calling
//! thread already occupies in a way that blocks this call's admission
//! (an exclusivity context being drained here, a held width slot when
//! a barrier is wanted, or all slots of a width-limited queue) can
//! never complete and panics immediately instead of hanging.

use crate::context::{self, ActiveQueueGuard, ExecutionContext};
use crate::continuation::{Continuation, SyncGate};
use crate::queue::{Queue, MAX_TARGET_DEPTH};
use std::sync::Arc;

/// Releases an acquired admission when dropped, re-arming the queue.
///
/// Drop-based so the admission is returned even when the caller's
/// closure panics mid-flight.
struct AdmissionGuard {
    queue: Queue,
    barrier: bool,
}

impl Drop for AdmissionGuard {
    fn drop(&mut self) {
        if self.barrier {
            self.queue.release_barrier_and_rewake();
        } else {
            self.queue.release_slot_and_rewake();
        }
    }
}

impl Queue {
    /// Executes `f` synchronously on this queue, blocking the calling
    /// thread until it has run. Returns `f`'s result.
    ///
    /// On a serial queue `f` is exclusive like every other continuation;
    /// on a concurrent queue it occupies one width slot.
    ///
    /// Admission scope: a caller admitted immediately holds admission at
    /// every queue on the target chain, exactly like asynchronous work.
    /// A caller that had to block behind enqueued work holds only *this*
    /// queue's admission when it runs; it is still ordered FIFO against
    /// this queue's other continuations, but it does not additionally
    /// serialize through ancestor queues.
    ///
    /// # Panics
    ///
    /// Panics on detected self-deadlock: calling this from code whose
    /// own holds on this queue (or on an ancestor that must run this
    /// queue's drain pass) block the admission this call needs, such as
    /// a continuation on the same serial queue or the last free slot of
    /// a concurrent one.
    pub fn submit_sync<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.sync_impl(f, false)
    }

    /// Like [`submit_sync`](Self::submit_sync), but `f` is a barrier:
    /// exclusive against every continuation on this queue. The admission
    /// scope caveat of [`submit_sync`](Self::submit_sync) applies here
    /// too.
    pub fn submit_sync_barrier<T, F>(&self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        self.sync_impl(f, true)
    }

    fn sync_impl<T, F>(&self, f: F, barrier: bool) -> T
    where
        F: FnOnce() -> T,
    {
        // Roots have unbounded width; there is nothing to admit against.
        if self.is_root() {
            let mut ctx = ExecutionContext::new();
            let prev = ctx.adopt(self.clone(), None, self.qos());
            let result = f();
            ctx.restore(prev);
            return result;
        }

        let needs_barrier = barrier || self.is_serial();
        self.check_self_deadlock(needs_barrier);

        if let Some(guards) = self.try_acquire_chain(needs_barrier) {
            // Fast path: admission held along the whole chain; run inline.
            let _markers: Vec<ActiveQueueGuard> = guards
                .iter()
                .map(|g| {
                    if g.barrier {
                        ActiveQueueGuard::enter(g.queue.id())
                    } else {
                        ActiveQueueGuard::enter_slot(g.queue.id())
                    }
                })
                .collect();
            let mut ctx = ExecutionContext::new();
            let prev = ctx.adopt(self.clone(), None, self.qos());
            let result = f();
            ctx.restore(prev);
            return result;
        }

        // Slow path: enqueue a gate in FIFO position and wait for a
        // worker to acquire our admission and transfer it back.
        let gate = Arc::new(SyncGate::new());
        self.push(Continuation::sync_transfer(
            Arc::clone(&gate),
            needs_barrier,
            self.qos(),
        ));
        gate.wait();

        let _released = AdmissionGuard {
            queue: self.clone(),
            barrier: needs_barrier,
        };
        let _marker = if needs_barrier {
            ActiveQueueGuard::enter(self.id())
        } else {
            ActiveQueueGuard::enter_slot(self.id())
        };
        let mut ctx = ExecutionContext::new();
        let prev = ctx.adopt(self.clone(), None, self.qos());
        let result = f();
        ctx.restore(prev);
        result
    }

    /// Panics if the admission this call needs at any level of the
    /// target chain can never be granted because the calling thread
    /// itself holds it: an exclusivity context, a slot where a barrier
    /// is wanted, or every slot where one more slot is wanted.
    fn check_self_deadlock(&self, barrier: bool) {
        let mut depth = 0;
        let mut cursor = Some(self.clone());
        while let Some(q) = cursor {
            if q.is_root() {
                break;
            }
            let want_barrier = if q.id() == self.id() {
                barrier
            } else {
                q.is_serial()
            };
            let held_slots = context::thread_slot_count(q.id());
            let wedged = context::thread_holds_exclusive(q.id())
                || (want_barrier && held_slots > 0)
                || (!want_barrier && held_slots >= q.max_slots() as usize);
            assert!(
                !wedged,
                "deadlock: synchronous submission to queue '{}' from a thread already \
                 occupying '{}'",
                self.label(),
                q.label()
            );
            depth += 1;
            assert!(
                depth <= MAX_TARGET_DEPTH,
                "target chain through '{}' exceeds {} queues",
                self.label(),
                MAX_TARGET_DEPTH
            );
            cursor = q.target_queue();
        }
    }

    /// Attempts immediate admission at every non-root level of the
    /// target chain: barrier-class on this queue if requested (and
    /// always on serial queues), one width slot otherwise.
    ///
    /// Requires this queue to be idle (empty list, not suspended) so a
    /// fast-path caller cannot overtake already-enqueued work. Returns
    /// the acquired guards, or `None` after rolling back.
    fn try_acquire_chain(&self, barrier: bool) -> Option<Vec<AdmissionGuard>> {
        if self.is_suspended() || !self.items().is_empty() {
            return None;
        }
        let mut guards: Vec<AdmissionGuard> = Vec::new();
        let mut cursor = self.clone();
        loop {
            if cursor.is_root() {
                return Some(guards);
            }
            let want_barrier = if cursor.id() == self.id() {
                barrier
            } else {
                cursor.is_serial()
            };
            let acquired = if want_barrier {
                cursor.state().try_acquire_barrier()
            } else {
                cursor.state().try_admit(cursor.max_slots())
            };
            if !acquired {
                // Guards roll the partial acquisition back on drop.
                return None;
            }
            guards.push(AdmissionGuard {
                queue: cursor.clone(),
                barrier: want_barrier,
            });
            let next = cursor
                .target_queue()
                .expect("non-root queue must have a target");
            cursor = next;
        }
    }
}
