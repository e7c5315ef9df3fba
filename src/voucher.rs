//! Opaque context capability carried by continuations.
//!
//! A [`Voucher`] is an adopt-on-entry, restore-on-exit token: it is
//! captured when a continuation is submitted, installed as the execution
//! context's current voucher while the continuation runs, and the
//! previous voucher is restored afterwards. The engine never looks inside
//! it; the payload belongs entirely to the embedding system (activity
//! tracing, request attribution, and the like).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A cloneable, opaque capability token.
///
/// Cloning is cheap (a reference-count bump); all clones refer to the
/// same payload.
#[derive(Clone)]
pub struct Voucher {
    payload: Arc<dyn Any + Send + Sync>,
}

impl Voucher {
    /// Wraps an arbitrary payload in a voucher.
    #[must_use]
    pub fn new<T: Any + Send + Sync>(payload: T) -> Self {
        Self {
            payload: Arc::new(payload),
        }
    }

    /// Downcasts the payload back to its concrete type.
    ///
    /// Returns `None` if the payload is of a different type. This is the
    /// only way to observe the payload; the scheduling engine itself
    /// never calls it.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    /// Returns `true` if both vouchers refer to the same payload.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.payload, &other.payload)
    }
}

impl fmt::Debug for Voucher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Voucher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_payload() {
        let voucher = Voucher::new("activity-17".to_string());
        assert_eq!(
            voucher.downcast_ref::<String>().map(String::as_str),
            Some("activity-17")
        );
        assert!(voucher.downcast_ref::<u64>().is_none());
    }

    #[test]
    fn clones_share_payload() {
        let a = Voucher::new(42_u64);
        let b = a.clone();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&Voucher::new(42_u64)));
    }
}
