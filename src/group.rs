//! Completion groups: count outstanding work and observe the moment the
//! count returns to zero.
//!
//! A group is a counter with blocking waiters and asynchronous
//! notifications attached. Work joins explicitly through
//! [`Group::enter`]/[`Group::leave`] or implicitly through
//! [`Group::submit`], which pairs the two around a closure even when the
//! closure panics.

use crate::queue::Queue;
use crate::voucher::Voucher;
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Result of a bounded [`Group::wait_timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The group's count reached zero within the timeout.
    Completed,
    /// Work was still outstanding when the timeout elapsed.
    TimedOut,
}

struct NotifyEntry {
    queue: Queue,
    work: Box<dyn FnOnce() + Send + 'static>,
}

struct GroupInner {
    count: AtomicIsize,
    mutex: Mutex<()>,
    condvar: Condvar,
    // Drained on every zero-crossing; the lock also serializes
    // registration against a concurrent crossing so an entry is either
    // submitted directly or picked up by the drain, never lost.
    notifications: parking_lot::Mutex<SmallVec<[NotifyEntry; 2]>>,
}

/// A counter tying independent pieces of work into one completion event.
#[derive(Clone)]
pub struct Group {
    inner: Arc<GroupInner>,
}

impl Group {
    /// Creates an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                count: AtomicIsize::new(0),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                notifications: parking_lot::Mutex::new(SmallVec::new()),
            }),
        }
    }

    /// Number of outstanding joins. Racy by nature; meaningful only for
    /// diagnostics.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        usize::try_from(self.inner.count.load(Ordering::Acquire)).unwrap_or(0)
    }

    /// Manually joins the group. Every `enter` must be balanced by
    /// exactly one [`leave`](Self::leave).
    pub fn enter(&self) {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Balances a prior [`enter`](Self::enter).
    ///
    /// # Panics
    ///
    /// Panics if the count would go below zero.
    pub fn leave(&self) {
        let prev = self.inner.count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "group leave without matching enter");
        if prev == 1 {
            self.fire();
        }
    }

    /// Submits `f` to `queue` as group work: enters before enqueueing
    /// and leaves when the closure finishes, panic included.
    pub fn submit<F>(&self, queue: &Queue, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enter();
        let leave = LeaveGuard {
            group: self.clone(),
        };
        queue.submit_async(move || {
            let _leave = leave;
            f();
        });
    }

    /// Like [`submit`](Self::submit) with a voucher propagated to the
    /// closure's execution context.
    pub fn submit_with_voucher<F>(&self, queue: &Queue, voucher: Voucher, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enter();
        let leave = LeaveGuard {
            group: self.clone(),
        };
        queue.submit_async_with_voucher(
            move |_ctx| {
                let _leave = leave;
                f();
            },
            voucher,
        );
    }

    /// Blocks until the count reaches zero. Returns immediately if the
    /// group is already empty.
    pub fn wait(&self) {
        let mut guard = self.inner.mutex.lock().expect("group mutex poisoned");
        while self.inner.count.load(Ordering::Acquire) > 0 {
            guard = self
                .inner
                .condvar
                .wait(guard)
                .expect("group mutex poisoned");
        }
    }

    /// Blocks until the count reaches zero or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> WaitOutcome {
        let deadline = std::time::Instant::now() + timeout;
        let mut guard = self.inner.mutex.lock().expect("group mutex poisoned");
        while self.inner.count.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return WaitOutcome::TimedOut;
            }
            let (g, _) = self
                .inner
                .condvar
                .wait_timeout(guard, remaining)
                .expect("group mutex poisoned");
            guard = g;
        }
        WaitOutcome::Completed
    }

    /// Registers `f` to run on `queue` at the next zero-crossing, or
    /// immediately if the group is already empty.
    ///
    /// Each registration fires exactly once.
    pub fn notify<F>(&self, queue: &Queue, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut pending = self.inner.notifications.lock();
        if self.inner.count.load(Ordering::Acquire) == 0 {
            drop(pending);
            queue.submit_async(f);
        } else {
            pending.push(NotifyEntry {
                queue: queue.clone(),
                work: Box::new(f),
            });
        }
    }

    /// Zero-crossing: wake blocked waiters, then hand registered
    /// notifications to their queues.
    fn fire(&self) {
        {
            let _guard = self.inner.mutex.lock().expect("group mutex poisoned");
            self.inner.condvar.notify_all();
        }
        let drained: SmallVec<[NotifyEntry; 2]> =
            std::mem::take(&mut *self.inner.notifications.lock());
        for entry in drained {
            entry.queue.submit_async(entry.work);
        }
    }
}

impl Default for Group {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

struct LeaveGuard {
    group: Group,
}

impl Drop for LeaveGuard {
    fn drop(&mut self) {
        self.group.leave();
    }
}
