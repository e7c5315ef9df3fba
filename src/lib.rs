//! Strand: a cooperative dispatch-queue engine for Rust.
//!
//! # Overview
//!
//! Strand schedules closures onto lightweight queues instead of threads.
//! A queue is an ordering domain: serial queues run one continuation at
//! a time, concurrent queues admit up to a fixed width with barriers for
//! exclusive phases. Queues form a targeting hierarchy that bottoms out
//! at a fixed set of root queues backed by a small OS thread pool, so an
//! application can carry thousands of queues over a handful of threads.
//!
//! # Core Guarantees
//!
//! - **FIFO per queue**: continuations start in submission order
//! - **Serial exclusivity**: a serial queue never runs two continuations at once
//! - **Barrier exclusivity**: a barrier runs alone on its queue
//! - **Lock transfer**: [`Queue::submit_sync`] runs the closure on the
//!   calling thread under the queue's exclusivity, without a worker handoff
//! - **Fail-fast misuse**: unbalanced resume, target cycles, and
//!   self-deadlocking synchronous submission panic instead of hanging
//!
//! # Module Structure
//!
//! - [`queue`]: queues, submission, suspension, and retargeting
//! - [`pool`]: root queues and the worker pool behind them
//! - [`group`]: completion groups over independent work
//! - [`config`]: pool configuration and `STRAND_*` environment overrides
//! - [`context`]: the per-execution context (queue, voucher, QoS)
//! - [`voucher`]: opaque payloads carried across asynchronous boundaries
//! - [`types`]: identifiers, widths, and QoS classes
//! - [`error`]: configuration errors

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]

pub mod config;
pub mod context;
mod continuation;
mod drain;
pub mod error;
pub mod group;
mod list;
pub mod pool;
pub mod queue;
mod state;
mod sync_call;
pub mod test_utils;
pub mod types;
pub mod voucher;

pub use config::PoolConfig;
pub use context::ExecutionContext;
pub use error::ConfigError;
pub use group::{Group, WaitOutcome};
pub use pool::{global_queue, Pool};
pub use queue::Queue;
pub use types::{QosClass, QueueId, Width};
pub use voucher::Voucher;
