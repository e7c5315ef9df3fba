//! The work-item record consumed by the drain loop.
//!
//! A [`Continuation`] is allocated at submission and consumed exactly
//! once. Its payload is a closed set of variants rather than a
//! function-pointer vtable: a user closure, a drain pass over a child
//! queue (how non-root queues ride their target's admission), or a
//! synchronous-transfer gate (how a blocked `submit_sync` caller is
//! handed the queue instead of having a worker run its closure).

use crate::context::ExecutionContext;
use crate::drain;
use crate::queue::Queue;
use crate::types::{ContinuationFlags, QosClass};
use crate::voucher::Voucher;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

/// The payload of a continuation.
pub(crate) enum Work {
    /// A user-submitted closure, executed under the adopted context.
    Closure(Box<dyn FnOnce(&mut ExecutionContext) + Send + 'static>),
    /// A drain pass over a (non-root) queue that woke up.
    DrainPass(Queue),
    /// Hand admission to a blocked synchronous caller.
    SyncTransfer(Arc<SyncGate>),
}

/// A queued unit of work: payload plus submission-time metadata.
pub(crate) struct Continuation {
    work: Work,
    flags: ContinuationFlags,
    qos: QosClass,
    voucher: Option<Voucher>,
}

impl Continuation {
    /// Builds an asynchronous continuation from a plain user closure.
    pub(crate) fn new_async<F>(
        f: F,
        flags: ContinuationFlags,
        qos: QosClass,
        voucher: Option<Voucher>,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            work: Work::Closure(Box::new(move |_ctx| f())),
            flags,
            qos,
            voucher,
        }
    }

    /// Builds a continuation from an engine-internal closure that needs
    /// the execution context (redirect wrappers, notify submissions).
    pub(crate) fn new_internal<F>(
        f: F,
        flags: ContinuationFlags,
        qos: QosClass,
        voucher: Option<Voucher>,
    ) -> Self
    where
        F: FnOnce(&mut ExecutionContext) + Send + 'static,
    {
        Self {
            work: Work::Closure(Box::new(f)),
            flags,
            qos,
            voucher,
        }
    }

    /// Builds the drain-pass item a woken queue pushes onto its target.
    pub(crate) fn drain_pass(queue: Queue) -> Self {
        let qos = queue.qos();
        Self {
            work: Work::DrainPass(queue),
            flags: ContinuationFlags::empty(),
            qos,
            voucher: None,
        }
    }

    /// Builds the gate item a blocked synchronous caller enqueues.
    pub(crate) fn sync_transfer(gate: Arc<SyncGate>, barrier: bool, qos: QosClass) -> Self {
        let mut flags = ContinuationFlags::SLOW_SYNC;
        if barrier {
            flags.insert(ContinuationFlags::BARRIER);
        }
        Self {
            work: Work::SyncTransfer(gate),
            flags,
            qos,
            voucher: None,
        }
    }

    pub(crate) fn qos(&self) -> QosClass {
        self.qos
    }

    pub(crate) fn is_barrier(&self) -> bool {
        self.flags.contains(ContinuationFlags::BARRIER)
    }

    pub(crate) fn is_slow_sync(&self) -> bool {
        self.flags.contains(ContinuationFlags::SLOW_SYNC)
    }

    pub(crate) fn was_deferred(&self) -> bool {
        self.flags.contains(ContinuationFlags::DEFERRED)
    }

    pub(crate) fn mark_deferred(&mut self) {
        self.flags.insert(ContinuationFlags::DEFERRED);
    }

    /// The gate of a slow-sync item.
    pub(crate) fn take_gate(self) -> Option<Arc<SyncGate>> {
        match self.work {
            Work::SyncTransfer(gate) => Some(gate),
            _ => None,
        }
    }

    /// Consumes the continuation, executing it under `ctx` on behalf of
    /// `queue`.
    ///
    /// The continuation's voucher and QoS are adopted for the duration
    /// and the previous context is restored afterwards. A panicking user
    /// closure is caught and logged; scheduling state is owned by the
    /// caller and stays consistent.
    pub(crate) fn execute(self, ctx: &mut ExecutionContext, queue: &Queue) {
        let prev = ctx.adopt(queue.clone(), self.voucher, self.qos);
        match self.work {
            Work::Closure(f) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| f(ctx)));
                if result.is_err() {
                    tracing::error!(queue = %queue.id(), label = queue.label(), "continuation panicked");
                }
            }
            Work::DrainPass(child) => drain::drain(&child, ctx),
            // Non-root drains intercept sync transfers before execute();
            // reaching here means the item sits on an unbounded root, where
            // signalling needs no admission.
            Work::SyncTransfer(gate) => gate.signal(),
        }
        ctx.restore(prev);
    }
}

impl std::fmt::Debug for Continuation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.work {
            Work::Closure(_) => "closure",
            Work::DrainPass(_) => "drain-pass",
            Work::SyncTransfer(_) => "sync-transfer",
        };
        f.debug_struct("Continuation")
            .field("kind", &kind)
            .field("flags", &self.flags)
            .field("qos", &self.qos)
            .finish()
    }
}

/// Completion cell a blocked synchronous caller waits on.
///
/// Signalling transfers the acquired admission to the caller; the worker
/// never runs the caller's closure.
#[derive(Debug, Default)]
pub(crate) struct SyncGate {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl SyncGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn signal(&self) {
        let mut done = self.done.lock().expect("sync gate poisoned");
        *done = true;
        drop(done);
        self.condvar.notify_one();
    }

    pub(crate) fn wait(&self) {
        let mut done = self.done.lock().expect("sync gate poisoned");
        while !*done {
            done = self.condvar.wait(done).expect("sync gate poisoned");
        }
    }

    #[cfg(test)]
    pub(crate) fn wait_timeout(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut done = self.done.lock().expect("sync gate poisoned");
        while !*done {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _) = self
                .condvar
                .wait_timeout(done, remaining)
                .expect("sync gate poisoned");
            done = guard;
        }
        true
    }
}
