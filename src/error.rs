//! Error types and the error-handling strategy.
//!
//! The engine splits failures into two classes, following a fail-fast
//! philosophy: corrupting shared scheduling state is strictly worse than
//! crashing.
//!
//! - **Usage errors** are unrecoverable by design and panic at the
//!   violation site: synchronous submission onto a queue the calling
//!   thread is already draining, unbalanced `suspend`/`resume` pairs,
//!   target-chain cycles, and dropping the last handle to a queue that
//!   still has enqueued work. None of these are surfaced as `Result`s;
//!   "recovering" would silently lose queued work or double-admit a
//!   barrier.
//! - **Configuration errors** are ordinary typed errors: a set but
//!   unparseable `STRAND_*` environment variable or an inconsistent
//!   builder value yields a [`ConfigError`].
//!
//! Resource exhaustion (worker-thread spawn failure) is neither: it is
//! retried with bounded backoff inside the pool and logged, never
//! reported to submitters, because `submit_async` has no failure mode
//! once the continuation is constructed.

use thiserror::Error;

/// Error produced while resolving pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable was set but could not be parsed.
    #[error("invalid value for {var}: {value:?} ({reason})")]
    InvalidEnvValue {
        /// The environment variable name.
        var: &'static str,
        /// The raw value that failed to parse.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// A configuration field held a value the pool cannot honor.
    #[error("invalid configuration: {field} {reason}")]
    InvalidField {
        /// The configuration field name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
