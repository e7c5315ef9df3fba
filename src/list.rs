//! The per-queue pending list.
//!
//! Submissions land in a lock-free MPSC structure: a `SegQueue` carries
//! the FIFO order and an atomic length makes the idle→non-empty
//! transition observable so exactly one pusher triggers wakeup.
//! Consumer-side exclusivity is *not* inferred from pointer values (the
//! classic mediator-sentinel trick); it lives in the queue's admission
//! word as a dedicated drain-lock bit.
//!
//! The stash is a small consumer-side front buffer: items popped by a
//! drain pass but deferred by an admission failure go back to the head so
//! FIFO order survives across passes. Only the drain-rights holder
//! touches it, so the mutex is never contended.

use crate::continuation::Continuation;
use crossbeam_queue::SegQueue;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub(crate) struct PendingList {
    items: SegQueue<Continuation>,
    stash: Mutex<VecDeque<Continuation>>,
    len: CachePadded<AtomicUsize>,
}

impl PendingList {
    pub(crate) fn new() -> Self {
        Self {
            items: SegQueue::new(),
            stash: Mutex::new(VecDeque::new()),
            len: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Appends an item. Never blocks.
    ///
    /// Returns `true` when this push moved the list from empty to
    /// non-empty; that pusher is responsible for triggering wakeup.
    pub(crate) fn push(&self, item: Continuation) -> bool {
        // Length first: a concurrent pop that wins the `SegQueue` race
        // must see a length it can decrement without wrapping. Wakeup
        // happens after push returns, so visibility of the item itself
        // is not at stake.
        let was_idle = self.len.fetch_add(1, Ordering::AcqRel) == 0;
        self.items.push(item);
        was_idle
    }

    /// Pops the next item in FIFO order: deferred stash first, then the
    /// shared queue. Only the drain-rights holder may call this.
    pub(crate) fn pop(&self) -> Option<Continuation> {
        let item = {
            let mut stash = self.stash.lock();
            stash.pop_front()
        }
        .or_else(|| self.items.pop());
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    /// Returns a popped-but-deferred item to the head of the list.
    pub(crate) fn stash_front(&self, item: Continuation) {
        self.len.fetch_add(1, Ordering::AcqRel);
        self.stash.lock().push_front(item);
    }

    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PendingList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingList").field("len", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContinuationFlags, QosClass};
    use std::sync::Arc;
    use std::thread;

    fn item() -> Continuation {
        Continuation::new_async(|| {}, ContinuationFlags::empty(), QosClass::Default, None)
    }

    #[test]
    fn push_reports_idle_transition() {
        let list = PendingList::new();
        assert!(list.push(item()));
        assert!(!list.push(item()));
        assert!(list.pop().is_some());
        assert!(list.pop().is_some());
        assert!(list.pop().is_none());
        assert!(list.push(item()));
    }

    #[test]
    fn stash_pops_before_queue() {
        let list = PendingList::new();
        list.push(item());
        let deferred = {
            let mut head = list.pop().expect("pushed item");
            head.mark_deferred();
            head
        };
        list.push(item());
        list.stash_front(deferred);
        assert_eq!(list.len(), 2);

        let first = list.pop().expect("stash item");
        assert!(first.was_deferred());
        let second = list.pop().expect("queued item");
        assert!(!second.was_deferred());
        assert!(list.is_empty());
    }

    #[test]
    fn exactly_one_concurrent_pusher_sees_idle() {
        const PUSHERS: usize = 8;
        const ROUNDS: usize = 200;

        for _ in 0..ROUNDS {
            let list = Arc::new(PendingList::new());
            let barrier = Arc::new(std::sync::Barrier::new(PUSHERS));
            let idle_claims: Vec<_> = (0..PUSHERS)
                .map(|_| {
                    let list = Arc::clone(&list);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        list.push(item())
                    })
                })
                .collect();
            let claims = idle_claims
                .into_iter()
                .map(|h| h.join().expect("pusher panicked"))
                .filter(|&claimed| claimed)
                .count();
            assert_eq!(claims, 1);
            assert_eq!(list.len(), PUSHERS);
        }
    }

    #[test]
    fn length_never_wraps_under_concurrent_pop() {
        const TOTAL: usize = 4_000;

        let list = Arc::new(PendingList::new());
        let pusher = {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                for _ in 0..TOTAL {
                    list.push(item());
                }
            })
        };

        // Race pops against in-flight pushes; a wrapped counter shows up
        // as an absurd length long before the list could hold that much.
        let mut popped = 0;
        while popped < TOTAL {
            if list.pop().is_some() {
                popped += 1;
            }
            assert!(list.len() <= TOTAL, "pending length wrapped");
        }
        pusher.join().expect("pusher panicked");
        assert!(list.is_empty());
        assert!(list.pop().is_none());
    }
}
