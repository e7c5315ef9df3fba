//! Explicit execution context threaded through the drain loop.
//!
//! Instead of stashing the current queue, voucher, and priority in
//! thread-local slots and swapping them around every call, the engine
//! passes an [`ExecutionContext`] explicitly into every execution. That
//! keeps propagation auditable and lets tests observe it without
//! thread-local mocking.
//!
//! The one deliberate exception is the misuse detector: a thread-local
//! stack of queue ids currently draining on this thread. It exists only
//! to turn self-deadlocking synchronous submissions into immediate
//! panics and carries no scheduling state.

use crate::queue::Queue;
use crate::types::{QosClass, QueueId};
use crate::voucher::Voucher;
use std::cell::RefCell;

/// The context a continuation executes under.
///
/// Owned by the executing worker (or the synchronous caller on the
/// inline paths) and mutated only through adopt/restore pairs.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    current_queue: Option<Queue>,
    current_voucher: Option<Voucher>,
    current_qos: Option<QosClass>,
}

impl ExecutionContext {
    /// Creates an empty context (nothing adopted yet).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The queue whose continuation is currently executing, if any.
    #[must_use]
    pub fn current_queue(&self) -> Option<&Queue> {
        self.current_queue.as_ref()
    }

    /// The voucher adopted for the current continuation, if any.
    #[must_use]
    pub fn current_voucher(&self) -> Option<&Voucher> {
        self.current_voucher.as_ref()
    }

    /// The QoS class adopted for the current continuation, if any.
    #[must_use]
    pub fn current_qos(&self) -> Option<QosClass> {
        self.current_qos
    }

    /// Adopts a continuation's identity, returning the displaced values.
    ///
    /// The caller must pass the returned [`Adopted`] back to
    /// [`restore`](Self::restore) when the continuation finishes.
    pub(crate) fn adopt(
        &mut self,
        queue: Queue,
        voucher: Option<Voucher>,
        qos: QosClass,
    ) -> Adopted {
        Adopted {
            queue: self.current_queue.replace(queue),
            voucher: std::mem::replace(&mut self.current_voucher, voucher),
            qos: self.current_qos.replace(qos),
        }
    }

    /// Restores the values displaced by a matching [`adopt`](Self::adopt).
    pub(crate) fn restore(&mut self, prev: Adopted) {
        self.current_queue = prev.queue;
        self.current_voucher = prev.voucher;
        self.current_qos = prev.qos;
    }
}

/// Values displaced by an adopt, to be restored on exit.
pub(crate) struct Adopted {
    queue: Option<Queue>,
    voucher: Option<Voucher>,
    qos: Option<QosClass>,
}

/// How the current thread holds a queue's admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HoldKind {
    /// Drain or barrier exclusivity; blocks every admission class.
    Exclusive,
    /// One width slot, held while a redirected item executes.
    Slot,
}

thread_local! {
    /// Queue admissions held by code currently running on this thread:
    /// drain passes, inline/transferred barrier execution, and the width
    /// slots of redirected items.
    static ACTIVE_QUEUES: RefCell<Vec<(QueueId, HoldKind)>> =
        const { RefCell::new(Vec::new()) };
}

/// Returns `true` if the current thread holds an exclusivity context on
/// the given queue.
pub(crate) fn thread_holds_exclusive(id: QueueId) -> bool {
    ACTIVE_QUEUES.with(|stack| {
        stack
            .borrow()
            .iter()
            .any(|&(held, kind)| held == id && kind == HoldKind::Exclusive)
    })
}

/// Number of width slots of the given queue held by the current thread.
pub(crate) fn thread_slot_count(id: QueueId) -> usize {
    ACTIVE_QUEUES.with(|stack| {
        stack
            .borrow()
            .iter()
            .filter(|&&(held, kind)| held == id && kind == HoldKind::Slot)
            .count()
    })
}

/// Marks a queue admission as held by this thread for the guard's
/// lifetime.
pub(crate) struct ActiveQueueGuard {
    id: QueueId,
    kind: HoldKind,
}

impl ActiveQueueGuard {
    /// Marks an exclusivity context: a drain pass or barrier execution.
    pub(crate) fn enter(id: QueueId) -> Self {
        Self::enter_kind(id, HoldKind::Exclusive)
    }

    /// Marks one held width slot.
    pub(crate) fn enter_slot(id: QueueId) -> Self {
        Self::enter_kind(id, HoldKind::Slot)
    }

    fn enter_kind(id: QueueId, kind: HoldKind) -> Self {
        ACTIVE_QUEUES.with(|stack| stack.borrow_mut().push((id, kind)));
        Self { id, kind }
    }
}

impl Drop for ActiveQueueGuard {
    fn drop(&mut self) {
        ACTIVE_QUEUES.with(|stack| {
            let mut stack = stack.borrow_mut();
            // Pop by value: guards are dropped in LIFO order on the happy
            // path, but a panic unwinding through nested drains may
            // release them out of order.
            if let Some(pos) = stack
                .iter()
                .rposition(|&entry| entry == (self.id, self.kind))
            {
                stack.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use crate::types::Width;

    #[test]
    fn adopt_and_restore_nest() {
        let pool = Pool::for_testing();
        let outer_q = pool.queue("outer", Width::Serial);
        let inner_q = pool.queue("inner", Width::Serial);

        let mut ctx = ExecutionContext::new();
        assert!(ctx.current_queue().is_none());

        let outer_voucher = Voucher::new(1_u32);
        let prev = ctx.adopt(outer_q.clone(), Some(outer_voucher), QosClass::Default);
        assert_eq!(ctx.current_queue().map(Queue::id), Some(outer_q.id()));
        assert_eq!(ctx.current_qos(), Some(QosClass::Default));

        let inner = ctx.adopt(inner_q.clone(), None, QosClass::Utility);
        assert_eq!(ctx.current_queue().map(Queue::id), Some(inner_q.id()));
        assert!(ctx.current_voucher().is_none());

        ctx.restore(inner);
        assert_eq!(ctx.current_queue().map(Queue::id), Some(outer_q.id()));
        assert!(ctx.current_voucher().is_some());

        ctx.restore(prev);
        assert!(ctx.current_queue().is_none());
        assert!(ctx.current_voucher().is_none());
    }

    #[test]
    fn active_queue_guard_tracks_membership() {
        let id = QueueId::next();
        assert!(!thread_holds_exclusive(id));
        {
            let _guard = ActiveQueueGuard::enter(id);
            assert!(thread_holds_exclusive(id));
        }
        assert!(!thread_holds_exclusive(id));
    }

    #[test]
    fn slot_holds_are_counted_not_exclusive() {
        let id = QueueId::next();
        assert_eq!(thread_slot_count(id), 0);
        let first = ActiveQueueGuard::enter_slot(id);
        let second = ActiveQueueGuard::enter_slot(id);
        assert_eq!(thread_slot_count(id), 2);
        assert!(!thread_holds_exclusive(id));
        drop(first);
        assert_eq!(thread_slot_count(id), 1);
        drop(second);
        assert_eq!(thread_slot_count(id), 0);
    }

    #[test]
    fn out_of_order_release_is_tolerated() {
        let a = QueueId::next();
        let b = QueueId::next();
        let guard_a = ActiveQueueGuard::enter(a);
        let guard_b = ActiveQueueGuard::enter(b);
        drop(guard_a);
        assert!(thread_holds_exclusive(b));
        assert!(!thread_holds_exclusive(a));
        drop(guard_b);
        assert!(!thread_holds_exclusive(b));
    }
}
