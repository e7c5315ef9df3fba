//! Worker-pool configuration.
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: fields set on [`PoolConfig`] directly
//! 2. **Environment variables**: `STRAND_*` overrides
//! 3. **Defaults**: [`PoolConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `STRAND_MIN_THREADS` | `usize` | `min_threads` |
//! | `STRAND_MAX_THREADS` | `usize` | `max_threads` |
//! | `STRAND_THREAD_STACK_SIZE` | `usize` | `thread_stack_size` |
//! | `STRAND_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `STRAND_SPIN_LIMIT` | `u32` | `spin_limit` |

use crate::error::ConfigError;
use std::time::Duration;

/// Environment variable name for the minimum worker-thread count.
pub const ENV_MIN_THREADS: &str = "STRAND_MIN_THREADS";
/// Environment variable name for the maximum worker-thread count.
pub const ENV_MAX_THREADS: &str = "STRAND_MAX_THREADS";
/// Environment variable name for the worker stack size in bytes.
pub const ENV_THREAD_STACK_SIZE: &str = "STRAND_THREAD_STACK_SIZE";
/// Environment variable name for the worker thread-name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "STRAND_THREAD_NAME_PREFIX";
/// Environment variable name for the idle-spin iteration limit.
pub const ENV_SPIN_LIMIT: &str = "STRAND_SPIN_LIMIT";

/// Default idle timeout before retiring excess worker threads.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the worker pool backing the root queues.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of worker threads kept alive while idle.
    pub min_threads: usize,
    /// Maximum number of worker threads.
    pub max_threads: usize,
    /// Stack size for worker threads in bytes (0 = platform default).
    pub thread_stack_size: usize,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
    /// How long an excess worker idles before retiring.
    pub idle_timeout: Duration,
    /// Idle-spin iterations before a worker parks on the condvar.
    pub spin_limit: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
            thread_stack_size: 0,
            thread_name_prefix: "strand-worker".to_string(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            spin_limit: 64,
        }
    }
}

impl PoolConfig {
    /// Builds a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.normalize();
        Ok(config)
    }

    /// Applies `STRAND_*` environment overrides to this configuration.
    ///
    /// Only variables that are set are applied. Returns an error if a
    /// variable is set but holds an unparseable value.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(val) = read_env(ENV_MIN_THREADS) {
            self.min_threads = parse_usize(ENV_MIN_THREADS, &val)?;
        }
        if let Some(val) = read_env(ENV_MAX_THREADS) {
            self.max_threads = parse_usize(ENV_MAX_THREADS, &val)?;
        }
        if let Some(val) = read_env(ENV_THREAD_STACK_SIZE) {
            self.thread_stack_size = parse_usize(ENV_THREAD_STACK_SIZE, &val)?;
        }
        if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
            self.thread_name_prefix = val;
        }
        if let Some(val) = read_env(ENV_SPIN_LIMIT) {
            self.spin_limit = parse_u32(ENV_SPIN_LIMIT, &val)?;
        }
        Ok(())
    }

    /// Normalizes values to a consistent, runnable configuration.
    ///
    /// `max_threads` is raised to `min_threads` and to at least 1; pending
    /// work must always be able to acquire a worker eventually.
    pub fn normalize(&mut self) {
        if self.max_threads < self.min_threads {
            self.max_threads = self.min_threads;
        }
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
    }

    /// Validates the configuration without normalizing it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::InvalidField {
                field: "max_threads",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_threads < self.min_threads {
            return Err(ConfigError::InvalidField {
                field: "max_threads",
                reason: format!("must be >= min_threads ({})", self.min_threads),
            });
        }
        Ok(())
    }
}

fn read_env(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
        _ => None,
    }
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.parse::<usize>()
        .map_err(|e| ConfigError::InvalidEnvValue {
            var,
            value: val.to_string(),
            reason: e.to_string(),
        })
}

fn parse_u32(var: &'static str, val: &str) -> Result<u32, ConfigError> {
    val.parse::<u32>().map_err(|e| ConfigError::InvalidEnvValue {
        var,
        value: val.to_string(),
        reason: e.to_string(),
    })
}
