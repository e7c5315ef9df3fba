//! Queue objects: hierarchy, submission, suspension, and wakeup.
//!
//! A [`Queue`] is a cheap cloneable handle over shared state. Queues form
//! a finite acyclic graph through their target references; every chain
//! bottoms out at a root queue owned by a worker pool. The kinds are a
//! closed set:
//!
//! - **serial**: width 1, every continuation is an implicit barrier;
//! - **concurrent**: up to `width` non-barrier continuations in flight;
//! - **root**: target-less, effectively unbounded width, backed by the
//!   OS worker pool.
//!
//! Submission is wait-free: a push onto the lock-free pending list plus,
//! on the idle→non-empty transition, a wakeup that rides the target chain
//! as an ordinary drain-pass continuation until it reaches a root.

use crate::context::ExecutionContext;
use crate::continuation::Continuation;
use crate::list::PendingList;
use crate::pool::{Pool, Workers};
use crate::state::AdmissionState;
use crate::types::{ContinuationFlags, QosClass, QueueId, Width};
use crate::voucher::Voucher;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

/// Upper bound on target-chain length. Exceeding it means the caller has
/// built a cycle (or something indistinguishable from one) and is a
/// fatal usage error.
pub(crate) const MAX_TARGET_DEPTH: usize = 64;

/// What kind of queue this is; fixed at creation.
pub(crate) enum QueueKind {
    Serial,
    Concurrent { width: u32 },
    Root {
        class: QosClass,
        overcommit: bool,
        workers: Weak<Workers>,
    },
}

/// A dispatch queue handle.
///
/// Clones share the same underlying queue. Dropping the last handle to a
/// queue that still has enqueued work (or in-flight admissions) is a
/// fatal usage error and panics.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

pub(crate) struct QueueInner {
    id: QueueId,
    label: String,
    kind: QueueKind,
    state: AdmissionState,
    suspensions: AtomicU32,
    items: PendingList,
    target: Mutex<Option<Queue>>,
    qos: AtomicU8,
}

impl Queue {
    /// Creates a queue targeting the global pool's default root.
    ///
    /// Serial queues admit one continuation at a time; concurrent queues
    /// admit up to their width.
    #[must_use]
    pub fn new(label: impl Into<String>, width: Width) -> Self {
        Self::with_target(label, width, &Pool::global().default_root())
    }

    /// Creates a queue with an explicit target.
    ///
    /// # Panics
    ///
    /// Panics if the target chain is deeper than the engine supports
    /// (which implies a cycle).
    #[must_use]
    pub fn with_target(label: impl Into<String>, width: Width, target: &Queue) -> Self {
        check_chain_depth(target);
        let kind = match width {
            Width::Serial => QueueKind::Serial,
            Width::Concurrent(n) => QueueKind::Concurrent { width: n.get() },
        };
        Self {
            inner: Arc::new(QueueInner {
                id: QueueId::next(),
                label: label.into(),
                kind,
                state: AdmissionState::new(),
                suspensions: AtomicU32::new(0),
                items: PendingList::new(),
                target: Mutex::new(Some(target.clone())),
                qos: AtomicU8::new(target.qos().as_u8()),
            }),
        }
    }

    /// Creates a root queue. Only the pool does this.
    pub(crate) fn new_root(
        label: String,
        class: QosClass,
        overcommit: bool,
        workers: Weak<Workers>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                id: QueueId::next(),
                label,
                kind: QueueKind::Root {
                    class,
                    overcommit,
                    workers,
                },
                state: AdmissionState::new(),
                suspensions: AtomicU32::new(0),
                items: PendingList::new(),
                target: Mutex::new(None),
                qos: AtomicU8::new(class.as_u8()),
            }),
        }
    }

    /// The queue's unique id.
    #[must_use]
    pub fn id(&self) -> QueueId {
        self.inner.id
    }

    /// The diagnostic label given at creation.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// The QoS class this queue currently schedules under.
    #[must_use]
    pub fn qos(&self) -> QosClass {
        QosClass::from_u8(self.inner.qos.load(Ordering::Acquire))
    }

    /// Number of continuations waiting on this queue.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.items.len()
    }

    /// Returns `true` while at least one `suspend` is unbalanced.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.inner.suspensions.load(Ordering::Acquire) > 0
    }

    /// Submits an asynchronous continuation. Never blocks; cannot fail.
    pub fn submit_async<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Continuation::new_async(
            f,
            ContinuationFlags::empty(),
            self.qos(),
            None,
        ));
    }

    /// Submits an asynchronous continuation carrying a voucher.
    ///
    /// The voucher is adopted for the duration of the continuation and
    /// the previous voucher is restored afterwards; the closure receives
    /// the execution context it runs under, where the voucher (and the
    /// current queue and QoS) can be observed.
    pub fn submit_async_with_voucher<F>(&self, f: F, voucher: Voucher)
    where
        F: FnOnce(&ExecutionContext) + Send + 'static,
    {
        self.push(Continuation::new_internal(
            move |ctx| f(ctx),
            ContinuationFlags::empty(),
            self.qos(),
            Some(voucher),
        ));
    }

    /// Submits a barrier continuation: it executes exclusively with
    /// respect to every other continuation on this queue.
    ///
    /// On a root queue a barrier degenerates to a plain asynchronous
    /// submission; roots have no finite width to be exclusive against.
    pub fn submit_async_barrier<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.push(Continuation::new_async(
            f,
            ContinuationFlags::BARRIER,
            self.qos(),
            None,
        ));
    }

    /// Suspends the queue: drained continuations already executing run to
    /// completion, but nothing further is admitted until a balancing
    /// [`resume`](Self::resume).
    ///
    /// # Panics
    ///
    /// Panics on root queues; the global queues are never suspended.
    pub fn suspend(&self) {
        assert!(
            !self.is_root(),
            "cannot suspend global queue '{}'",
            self.label()
        );
        self.inner.suspensions.fetch_add(1, Ordering::AcqRel);
    }

    /// Resumes the queue. Suspend/resume must be strictly paired.
    ///
    /// # Panics
    ///
    /// Panics if the queue is not currently suspended (an unbalanced
    /// `resume` is a fatal usage error, detected here rather than later
    /// at drain time).
    pub fn resume(&self) {
        assert!(
            !self.is_root(),
            "cannot resume global queue '{}'",
            self.label()
        );
        let prev = self
            .inner
            .suspensions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
            .unwrap_or_else(|_| {
                panic!(
                    "resume without matching suspend on queue '{}'",
                    self.label()
                )
            });
        if prev == 1 {
            tracing::trace!(queue = %self.id(), label = self.label(), "queue resumed");
            self.wakeup();
        }
    }

    /// Redirects this queue at a new target.
    ///
    /// The swap itself is funneled through a barrier on this queue, so no
    /// continuation ever observes a torn target; the previous target
    /// handle is released only after the new one is installed.
    ///
    /// # Panics
    ///
    /// Panics if called on a root queue, or if the new target chain would
    /// contain this queue (a cycle) or exceed the supported depth.
    pub fn set_target(&self, new_target: &Queue) {
        assert!(
            !self.is_root(),
            "cannot retarget global queue '{}'",
            self.label()
        );
        let mut depth = 0;
        let mut cursor = Some(new_target.clone());
        while let Some(q) = cursor {
            assert!(
                q.id() != self.id(),
                "target cycle: queue '{}' would reach itself through '{}'",
                self.label(),
                new_target.label()
            );
            depth += 1;
            assert!(
                depth <= MAX_TARGET_DEPTH,
                "target chain for queue '{}' exceeds {} queues",
                self.label(),
                MAX_TARGET_DEPTH
            );
            cursor = q.target_queue();
        }

        let this = self.clone();
        let new_target = new_target.clone();
        self.push(Continuation::new_internal(
            move |_ctx| {
                let new_qos = new_target.qos();
                let previous = this.inner.target.lock().replace(new_target);
                this.inner.qos.store(new_qos.as_u8(), Ordering::Release);
                drop(previous);
            },
            ContinuationFlags::BARRIER,
            self.qos(),
            None,
        ));
    }

    /// Appends a continuation and wakes the queue if it was idle.
    pub(crate) fn push(&self, item: Continuation) {
        let was_idle = self.inner.items.push(item);
        if was_idle || self.is_root() {
            // A root has no single drain invocation; every newly pushed
            // item may need its own worker.
            self.wakeup();
        }
    }

    /// Makes the queue runnable: acquire the drain assignment and ride
    /// the target chain to a root, which requests OS workers.
    pub(crate) fn wakeup(&self) {
        if self.is_suspended() {
            return;
        }
        match &self.inner.kind {
            QueueKind::Root { workers, .. } => {
                if let Some(workers) = workers.upgrade() {
                    workers.request(self.inner.items.len().max(1));
                }
            }
            _ => {
                if self.inner.state.try_lock_drain() {
                    tracing::trace!(queue = %self.id(), label = self.label(), "queue wakeup");
                    let target = self
                        .target_queue()
                        .expect("non-root queue must have a target");
                    target.push(Continuation::drain_pass(self.clone()));
                }
            }
        }
    }

    /// The current target, if this is not a root queue.
    #[must_use]
    pub fn target_queue(&self) -> Option<Queue> {
        self.inner.target.lock().clone()
    }

    pub(crate) fn state(&self) -> &AdmissionState {
        &self.inner.state
    }

    pub(crate) fn items(&self) -> &PendingList {
        &self.inner.items
    }

    pub(crate) fn is_serial(&self) -> bool {
        matches!(self.inner.kind, QueueKind::Serial)
    }

    pub(crate) fn is_root(&self) -> bool {
        matches!(self.inner.kind, QueueKind::Root { .. })
    }

    /// Maximum concurrent non-barrier admissions.
    pub(crate) fn max_slots(&self) -> u32 {
        match self.inner.kind {
            QueueKind::Serial => 1,
            QueueKind::Concurrent { width } => width,
            QueueKind::Root { .. } => u32::MAX,
        }
    }

    pub(crate) fn root_class(&self) -> Option<(QosClass, bool)> {
        match self.inner.kind {
            QueueKind::Root {
                class, overcommit, ..
            } => Some((class, overcommit)),
            _ => None,
        }
    }

    /// Releases a non-barrier admission slot and re-arms the queue if
    /// work is still pending. Every admission-failure exit from the drain
    /// loop relies on this re-wakeup.
    pub(crate) fn release_slot_and_rewake(&self) {
        self.inner.state.release_slot();
        if !self.inner.items.is_empty() {
            self.wakeup();
        }
    }

    /// Releases the barrier and re-arms the queue if work is pending.
    pub(crate) fn release_barrier_and_rewake(&self) {
        self.inner.state.release_barrier();
        if !self.inner.items.is_empty() {
            self.wakeup();
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner.kind {
            QueueKind::Serial => "serial",
            QueueKind::Concurrent { .. } => "concurrent",
            QueueKind::Root { .. } => "root",
        };
        f.debug_struct("Queue")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("kind", &kind)
            .field("pending", &self.inner.items.len())
            .field("state", &self.inner.state.snapshot())
            .finish()
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        // Fatal usage errors: releasing a queue that still owns work or
        // is mid-execution would silently lose continuations.
        let pending = self.items.len();
        if pending > 0 {
            panic!(
                "queue '{}' released with {pending} enqueued continuation(s)",
                self.label
            );
        }
        let snapshot = self.state.snapshot();
        if snapshot.barrier || snapshot.slots > 0 {
            panic!(
                "queue '{}' released while continuations are executing",
                self.label
            );
        }
    }
}

fn check_chain_depth(target: &Queue) {
    let mut depth = 0;
    let mut cursor = Some(target.clone());
    while let Some(q) = cursor {
        depth += 1;
        assert!(
            depth <= MAX_TARGET_DEPTH,
            "target chain through '{}' exceeds {} queues",
            target.label(),
            MAX_TARGET_DEPTH
        );
        cursor = q.target_queue();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn labels_and_ids() {
        let pool = Pool::for_testing();
        let q = pool.queue("replies", Width::Serial);
        assert_eq!(q.label(), "replies");
        let q2 = pool.queue("replies", Width::Serial);
        assert_ne!(q.id(), q2.id());
    }

    #[test]
    fn queue_inherits_target_qos() {
        let pool = Pool::for_testing();
        let root = pool.root(QosClass::Utility, false);
        let q = Queue::with_target("worker", Width::Serial, &root);
        assert_eq!(q.qos(), QosClass::Utility);
    }

    #[test]
    fn submit_runs_on_pool() {
        init_test_logging();
        let pool = Pool::for_testing();
        let q = pool.queue("basic", Width::Serial);
        let ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&ran);
        q.submit_async(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        crate::test_utils::wait_until(Duration::from_secs(2), || {
            ran.load(Ordering::SeqCst) == 1
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "resume without matching suspend")]
    fn unbalanced_resume_panics() {
        let pool = Pool::for_testing();
        let q = pool.queue("unbalanced", Width::Serial);
        q.resume();
    }

    #[test]
    #[should_panic(expected = "cannot suspend global queue")]
    fn suspending_root_panics() {
        let pool = Pool::for_testing();
        pool.root(QosClass::Default, false).suspend();
    }

    #[test]
    #[should_panic(expected = "target cycle")]
    fn retarget_cycle_panics() {
        let pool = Pool::for_testing();
        let a = pool.queue("a", Width::Serial);
        let b = Queue::with_target("b", Width::Serial, &a);
        a.set_target(&b);
    }

    #[test]
    fn set_target_swaps_after_in_flight_work() {
        init_test_logging();
        let pool = Pool::for_testing();
        let old_root = pool.root(QosClass::Default, false);
        let new_root = pool.root(QosClass::UserInitiated, false);
        let q = Queue::with_target("movable", Width::Serial, &old_root);

        let ran = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&ran);
        q.submit_async(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        q.set_target(&new_root);

        crate::test_utils::wait_until(Duration::from_secs(2), || {
            q.target_queue().map(|t| t.id()) == Some(new_root.id())
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(q.qos(), QosClass::UserInitiated);
    }
}
