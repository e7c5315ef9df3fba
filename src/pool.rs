//! The root-queue set and the OS worker pool behind it.
//!
//! Root queues are target-less, effectively unbounded queues backed
//! directly by a small pool of OS threads. There is one root per QoS
//! class and overcommit flag, created once per pool and never destroyed;
//! the process-wide set is reachable only through [`global_queue`].
//!
//! # Thread Lifecycle
//!
//! Workers are spawned lazily up to `max_threads` and park on a condvar
//! when the roots are empty. A worker above `min_threads` that stays
//! idle past the configured timeout retires. Spawn failures are retried
//! with bounded backoff and logged; silently dropping a spawn request
//! could strand enqueued continuations.
//!
//! # Claiming
//!
//! A worker claims one item at a time, scanning roots from the highest
//! QoS class down, overcommit roots first within a class. Claimed items
//! are either directly submitted continuations or drain passes over
//! non-root queues that woke up.

use crate::config::PoolConfig;
use crate::context::ExecutionContext;
use crate::continuation::Continuation;
use crate::drain;
use crate::queue::Queue;
use crate::types::{QosClass, Width};
use crossbeam_utils::Backoff;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Spawn attempts before giving up on a single worker request.
const SPAWN_ATTEMPTS: u32 = 4;

static GLOBAL_POOL: OnceLock<Pool> = OnceLock::new();

/// Returns one of the fixed global root queues.
///
/// Global roots are created once, on first use, from
/// [`PoolConfig::from_env`] and are never destroyed or suspended.
#[must_use]
pub fn global_queue(class: QosClass, overcommit: bool) -> Queue {
    Pool::global().root(class, overcommit)
}

/// A worker pool plus its fixed set of root queues.
///
/// Most callers use the process-wide pool implicitly through
/// [`Queue::new`] and [`global_queue`]; embedding systems and tests can
/// build private pools with their own thread budgets.
pub struct Pool {
    workers: Arc<Workers>,
}

pub(crate) struct Workers {
    config: PoolConfig,
    roots: OnceLock<Vec<Queue>>,
    active_threads: AtomicUsize,
    busy_threads: AtomicUsize,
    next_worker_id: AtomicUsize,
    shutdown: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    /// Creates a pool with the given configuration (normalized first).
    #[must_use]
    pub fn new(mut config: PoolConfig) -> Self {
        config.normalize();
        let workers = Arc::new(Workers {
            config,
            roots: OnceLock::new(),
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            next_worker_id: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            handles: Mutex::new(Vec::new()),
        });

        let mut roots = Vec::with_capacity(QosClass::ALL.len() * 2);
        for class in QosClass::ALL {
            for overcommit in [false, true] {
                let label = if overcommit {
                    format!("strand.root.{class}.overcommit")
                } else {
                    format!("strand.root.{class}")
                };
                roots.push(Queue::new_root(
                    label,
                    class,
                    overcommit,
                    Arc::downgrade(&workers),
                ));
            }
        }
        workers
            .roots
            .set(roots)
            .unwrap_or_else(|_| unreachable!("roots initialized once"));

        let pool = Self { workers };
        for _ in 0..pool.workers.config.min_threads {
            pool.workers.spawn_worker();
        }
        pool
    }

    /// The process-wide pool, initialized once from the environment.
    ///
    /// An unparseable `STRAND_*` variable is logged and ignored in favor
    /// of defaults; lazy global initialization is not a place to crash.
    pub fn global() -> &'static Pool {
        GLOBAL_POOL.get_or_init(|| {
            let config = PoolConfig::from_env().unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid STRAND_* environment, using defaults");
                let mut config = PoolConfig::default();
                config.normalize();
                config
            });
            Pool::new(config)
        })
    }

    /// Returns this pool's root queue for `class` and `overcommit`.
    #[must_use]
    pub fn root(&self, class: QosClass, overcommit: bool) -> Queue {
        let idx = class.index() * 2 + usize::from(overcommit);
        self.workers.roots.get().expect("roots initialized")[idx].clone()
    }

    /// The default target for queues created without an explicit one:
    /// the default-class overcommit root, so a fresh queue's wakeup never
    /// waits behind a saturated non-overcommit root.
    #[must_use]
    pub fn default_root(&self) -> Queue {
        self.root(QosClass::Default, true)
    }

    /// Creates a queue owned by this pool's root set.
    #[must_use]
    pub fn queue(&self, label: impl Into<String>, width: Width) -> Queue {
        Queue::with_target(label, width, &self.default_root())
    }

    /// Number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.workers.active_threads.load(Ordering::Relaxed)
    }

    /// Number of workers currently executing work.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.workers.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns `true` once shutdown has begun.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.workers.shutdown.load(Ordering::Acquire)
    }

    /// Initiates shutdown. Pending work continues to drain; workers exit
    /// when the roots are empty.
    pub fn shutdown(&self) {
        self.workers.shutdown.store(true, Ordering::Release);
        self.workers.notify_all();
    }

    /// Shuts down and waits for all workers to exit.
    ///
    /// Returns `true` if every worker exited before the timeout.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        let deadline = std::time::Instant::now() + timeout;
        while self.workers.active_threads.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            self.workers.notify_all();
            thread::sleep(Duration::from_millis(5).min(remaining));
        }
        let mut handles = self.workers.handles.lock().expect("handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
        true
    }

    /// A small pool for unit tests: bounded threads, fast idle retire.
    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        Self::new(PoolConfig {
            min_threads: 0,
            max_threads: 4,
            thread_name_prefix: "strand-test".to_string(),
            idle_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        })
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // The global pool lives in a static and never reaches this; a
        // private pool drains and joins its workers.
        let _ = self.shutdown_and_wait(Duration::from_secs(5));
    }
}

impl Workers {
    /// Requests up to `n` workers for newly ready root items.
    ///
    /// Spawns until the count of non-busy workers covers the request
    /// or `max_threads` is reached; parked workers count as available
    /// because the notify below unparks them.
    pub(crate) fn request(self: &Arc<Self>, n: usize) {
        let wanted = n.min(self.config.max_threads);
        if !self.shutdown.load(Ordering::Acquire) {
            loop {
                let active = self.active_threads.load(Ordering::Relaxed);
                let busy = self.busy_threads.load(Ordering::Relaxed);
                let free = active.saturating_sub(busy);
                if free >= wanted || active >= self.config.max_threads {
                    break;
                }
                if !self.spawn_worker() {
                    break;
                }
            }
        }
        if wanted > 1 {
            self.notify_all();
        } else {
            self.notify_one();
        }
    }

    /// Spawns one worker, retrying with bounded backoff on OS failure.
    fn spawn_worker(self: &Arc<Self>) -> bool {
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{}", self.config.thread_name_prefix, worker_id);
        self.active_threads.fetch_add(1, Ordering::Relaxed);

        for attempt in 0..SPAWN_ATTEMPTS {
            let mut builder = thread::Builder::new().name(name.clone());
            if self.config.thread_stack_size > 0 {
                builder = builder.stack_size(self.config.thread_stack_size);
            }
            let workers = Arc::clone(self);
            match builder.spawn(move || {
                worker_loop(&workers);
                workers.active_threads.fetch_sub(1, Ordering::Relaxed);
            }) {
                Ok(handle) => {
                    self.handles.lock().expect("handles poisoned").push(handle);
                    return true;
                }
                Err(err) => {
                    tracing::warn!(
                        worker = %name,
                        attempt,
                        error = %err,
                        "worker spawn failed, backing off"
                    );
                    thread::sleep(Duration::from_millis(1 << attempt));
                }
            }
        }
        self.active_threads.fetch_sub(1, Ordering::Relaxed);
        tracing::error!(
            worker = %name,
            attempts = SPAWN_ATTEMPTS,
            "worker spawn failed, pending work waits for existing workers"
        );
        false
    }

    /// Claims one item: highest QoS class first, overcommit roots first
    /// within a class.
    fn claim(&self) -> Option<(Queue, Continuation)> {
        let roots = self.roots.get().expect("roots initialized");
        for class_idx in (0..QosClass::ALL.len()).rev() {
            for overcommit in [true, false] {
                let root = &roots[class_idx * 2 + usize::from(overcommit)];
                if let Some(item) = root.items().pop() {
                    return Some((root.clone(), item));
                }
            }
        }
        None
    }

    fn has_pending(&self) -> bool {
        self.roots
            .get()
            .expect("roots initialized")
            .iter()
            .any(|root| !root.items().is_empty())
    }

    fn pending_total(&self) -> usize {
        self.roots
            .get()
            .expect("roots initialized")
            .iter()
            .map(|root| root.items().len())
            .sum()
    }

    fn notify_one(&self) {
        let _guard = self.mutex.lock().expect("pool mutex poisoned");
        self.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.mutex.lock().expect("pool mutex poisoned");
        self.condvar.notify_all();
    }
}

/// The per-thread worker loop: claim, execute, spin, park, retire.
fn worker_loop(workers: &Arc<Workers>) {
    let mut ctx = ExecutionContext::new();
    'run: loop {
        if let Some((root, item)) = workers.claim() {
            workers.busy_threads.fetch_add(1, Ordering::Relaxed);
            // A push may have judged this worker free an instant before
            // it went busy; re-evaluate for whatever is still queued.
            let still_pending = workers.pending_total();
            if still_pending > 0 {
                workers.request(still_pending);
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                drain::run_root_item(&root, item, &mut ctx);
            }));
            workers.busy_threads.fetch_sub(1, Ordering::Relaxed);
            if result.is_err() {
                // User-closure panics are already caught closer in; this
                // only fires for panics out of the engine itself.
                tracing::error!(root = %root.id(), "root item panicked past the drain loop");
            }
            continue;
        }

        if workers.shutdown.load(Ordering::Acquire) {
            break;
        }

        // Bounded spin before parking: wakeups under load usually arrive
        // within a few claim attempts.
        let backoff = Backoff::new();
        for _ in 0..workers.config.spin_limit {
            if workers.has_pending() {
                continue 'run;
            }
            backoff.snooze();
        }

        let active = workers.active_threads.load(Ordering::Relaxed);
        if active > workers.config.min_threads {
            let guard = workers.mutex.lock().expect("pool mutex poisoned");
            let (_guard, timeout) = workers
                .condvar
                .wait_timeout(guard, workers.config.idle_timeout)
                .expect("pool mutex poisoned");
            if timeout.timed_out()
                && !workers.has_pending()
                && !workers.shutdown.load(Ordering::Acquire)
                && workers.active_threads.load(Ordering::Relaxed) > workers.config.min_threads
            {
                // Idle past the threshold with spare capacity: retire.
                break;
            }
        } else {
            let guard = workers.mutex.lock().expect("pool mutex poisoned");
            let _guard = workers
                .condvar
                .wait_timeout(guard, workers.config.idle_timeout)
                .expect("pool mutex poisoned");
        }
    }
}
