//! The drain loop: popping, admission, execution, and re-arming.
//!
//! A non-root queue is drained by exactly one invocation at a time (the
//! drain-lock bit). The loop pops pending continuations in FIFO order
//! and decides each one's fate by admission class:
//!
//! - **barrier-class** (explicit barriers, and everything on a serial
//!   queue): requires the barrier bit, which in turn requires zero
//!   in-flight admissions; executes inline on the draining thread.
//! - **non-barrier on a concurrent queue**: takes a width slot and is
//!   redirected to the target queue's own admission, bottoming out at a
//!   root, so a width-W queue really runs W continuations in parallel.
//! - **slow-sync**: the admission is acquired on behalf of a blocked
//!   synchronous caller; the gate is signalled and the caller runs the
//!   closure itself (lock transfer). Barrier-class transfers end the
//!   drain invocation; slot transfers let it continue.
//!
//! A barrier that cannot get exclusivity is deferred once while
//! non-barrier work behind it fills the remaining width; after that it
//! is stashed at the head and the pass ends. Every blocked exit is
//! re-armed by the releasing side (`release_*_and_rewake`), and the
//! empty exit double-checks the list after releasing the drain lock to
//! close the missed-wakeup race.

use crate::context::{ActiveQueueGuard, ExecutionContext};
use crate::continuation::Continuation;
use crate::queue::Queue;
use crate::types::ContinuationFlags;

/// Why a drain pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PassEnd {
    /// The pending list was exhausted.
    Empty,
    /// An admission failed; a release will re-arm the queue.
    Blocked,
    /// The queue is suspended; `resume` will re-arm it.
    Suspended,
}

/// Whether a barrier-class item ended the drain invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BarrierRun {
    Done,
    HandedOff,
}

/// Drains `queue` until its list empties, it suspends, or an admission
/// fails. The caller must already hold the drain lock.
pub(crate) fn drain(queue: &Queue, ctx: &mut ExecutionContext) {
    debug_assert!(!queue.is_root(), "root queues are claimed, not drained");
    let _active = ActiveQueueGuard::enter(queue.id());

    loop {
        let mut end = PassEnd::Empty;
        // A freshly deferred barrier, held aside while later non-barrier
        // work fills the remaining width.
        let mut held_barrier: Option<Continuation> = None;

        'pass: loop {
            if queue.is_suspended() {
                end = PassEnd::Suspended;
                break 'pass;
            }

            if let Some(barrier) = held_barrier.take() {
                if queue.state().try_acquire_barrier() {
                    match run_barrier_item(queue, ctx, barrier) {
                        BarrierRun::HandedOff => return,
                        BarrierRun::Done => continue 'pass,
                    }
                }
                held_barrier = Some(barrier);
            }

            let Some(mut item) = queue.items().pop() else {
                break 'pass;
            };

            if item.is_barrier() || queue.is_serial() {
                if held_barrier.is_some() {
                    // Two deferred barriers cannot be held aside; keep
                    // FIFO order and end the pass.
                    item.mark_deferred();
                    queue.items().stash_front(item);
                    end = PassEnd::Blocked;
                    break 'pass;
                }
                if queue.state().try_acquire_barrier() {
                    match run_barrier_item(queue, ctx, item) {
                        BarrierRun::HandedOff => return,
                        BarrierRun::Done => continue 'pass,
                    }
                }
                if !item.was_deferred() && !queue.is_serial() {
                    // Width tie-break: let non-barrier work already
                    // scheduled behind this barrier use the free slots.
                    item.mark_deferred();
                    held_barrier = Some(item);
                    continue 'pass;
                }
                item.mark_deferred();
                queue.items().stash_front(item);
                end = PassEnd::Blocked;
                break 'pass;
            }

            if queue.state().try_admit(queue.max_slots()) {
                if item.is_slow_sync() {
                    // Slot acquired on the blocked caller's behalf; the
                    // caller runs its closure concurrently with this pass.
                    let gate = item.take_gate().expect("slow-sync item carries a gate");
                    gate.signal();
                } else {
                    redirect(queue, item);
                }
            } else {
                item.mark_deferred();
                queue.items().stash_front(item);
                end = PassEnd::Blocked;
                break 'pass;
            }
        }

        if let Some(barrier) = held_barrier.take() {
            queue.items().stash_front(barrier);
            end = PassEnd::Blocked;
        }

        queue.state().unlock_drain();
        match end {
            PassEnd::Empty => {
                // Recheck after releasing the lock: a push that lost the
                // idle-transition race relies on this.
                if !queue.items().is_empty()
                    && !queue.is_suspended()
                    && queue.state().try_lock_drain()
                {
                    continue;
                }
                return;
            }
            PassEnd::Blocked => {
                // The admission holder may have released (and found the
                // drain bit still set) between our failed acquire and the
                // unlock above. Quiescence means every holder is gone, so
                // no future release will re-arm the queue; retry here.
                // A still-held admission keeps the retry off this path:
                // its release runs after our unlock and re-arms normally.
                if !queue.items().is_empty()
                    && !queue.is_suspended()
                    && queue.state().is_quiescent()
                    && queue.state().try_lock_drain()
                {
                    continue;
                }
                return;
            }
            PassEnd::Suspended => {
                // Same window against a concurrent resume: its wakeup
                // no-ops while we hold the drain bit.
                if !queue.is_suspended()
                    && !queue.items().is_empty()
                    && queue.state().try_lock_drain()
                {
                    continue;
                }
                return;
            }
        }
    }
}

/// Runs one barrier-class item under an already-acquired barrier bit.
fn run_barrier_item(queue: &Queue, ctx: &mut ExecutionContext, item: Continuation) -> BarrierRun {
    if item.is_slow_sync() {
        // Lock transfer: release the drain assignment first so the
        // caller's finishing wakeup can start a fresh pass, then wake it.
        queue.state().unlock_drain();
        let gate = item.take_gate().expect("slow-sync item carries a gate");
        tracing::trace!(queue = %queue.id(), "barrier transferred to blocked sync caller");
        gate.signal();
        return BarrierRun::HandedOff;
    }
    item.execute(ctx, queue);
    queue.state().release_barrier();
    BarrierRun::Done
}

/// Hands an admitted non-barrier item to the target queue's admission.
///
/// The wrapper owns one width slot of `queue`; the slot is released (and
/// the queue re-armed) when the item finishes, wherever it ran.
fn redirect(queue: &Queue, item: Continuation) {
    let target = queue
        .target_queue()
        .expect("non-root queue must have a target");
    let owner = queue.clone();
    let qos = item.qos();
    let wrapper = Continuation::new_internal(
        move |ctx| {
            {
                // Record the owning queue's slot so a synchronous call
                // from inside the item can refuse to wait on itself.
                let _held = ActiveQueueGuard::enter_slot(owner.id());
                item.execute(ctx, &owner);
            }
            owner.release_slot_and_rewake();
        },
        ContinuationFlags::empty(),
        qos,
        None,
    );
    target.push(wrapper);
}

/// Executes one item claimed from a root queue's list.
///
/// Roots have no finite width: closures run directly, drain passes run
/// the child queue's loop, and sync transfers just signal their gate.
pub(crate) fn run_root_item(root: &Queue, item: Continuation, ctx: &mut ExecutionContext) {
    item.execute(ctx, root);
}
