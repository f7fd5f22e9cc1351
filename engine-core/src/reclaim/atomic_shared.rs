//! Atomic shared pointer: the simpler reclamation alternative to hazard
//! pointers (SPEC_FULL.md §4.1). Trades ~5x extra cost per acquire (an
//! `Arc` clone through a lock) for eliminating manual protection and
//! deferred deletion entirely. Either this or `reclaim::hazard` may back a
//! lock-free queue; `AdaptiveQueue` and `LockFreeQueue` in this crate use
//! hazard pointers, but this type is exposed for callers who prefer the
//! simpler substrate.

use std::sync::{Arc, Mutex};

/// A mutex-protected `Arc<T>` slot exposing load/store/exchange/
/// compare-exchange with explicit semantics. Unlike a lock-free atomic
/// pointer this is implemented with an ordinary mutex: the point of this
/// type is simplicity and safety, not matching hazard-pointer performance.
pub struct AtomicSharedPtr<T> {
    slot: Mutex<Arc<T>>,
}

impl<T> AtomicSharedPtr<T> {
    pub fn new(value: T) -> Self {
        AtomicSharedPtr {
            slot: Mutex::new(Arc::new(value)),
        }
    }

    /// Returns a clone of the currently stored `Arc`.
    pub fn load(&self) -> Arc<T> {
        Arc::clone(&self.slot.lock().unwrap())
    }

    /// Replaces the stored value, returning the previous one.
    pub fn store(&self, value: T) -> Arc<T> {
        let mut slot = self.slot.lock().unwrap();
        std::mem::replace(&mut *slot, Arc::new(value))
    }

    /// Replaces the stored value with `new`, returning the previous `Arc`.
    pub fn exchange(&self, new: Arc<T>) -> Arc<T> {
        let mut slot = self.slot.lock().unwrap();
        std::mem::replace(&mut *slot, new)
    }

    /// Replaces the stored value with `new` only if it currently points to
    /// the same allocation as `current` (compared by `Arc::ptr_eq`).
    /// Returns `Ok(old)` on success or `Err(actual)` with the current value
    /// on failure.
    pub fn compare_exchange(
        &self,
        current: &Arc<T>,
        new: Arc<T>,
    ) -> Result<Arc<T>, Arc<T>> {
        let mut slot = self.slot.lock().unwrap();
        if Arc::ptr_eq(&slot, current) {
            Ok(std::mem::replace(&mut *slot, new))
        } else {
            Err(Arc::clone(&slot))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_load_round_trips() {
        let ptr = AtomicSharedPtr::new(5);
        assert_eq!(*ptr.load(), 5);
        ptr.store(9);
        assert_eq!(*ptr.load(), 9);
    }

    #[test]
    fn compare_exchange_succeeds_on_matching_pointer() {
        let ptr = AtomicSharedPtr::new(1);
        let current = ptr.load();
        let result = ptr.compare_exchange(&current, Arc::new(2));
        assert!(result.is_ok());
        assert_eq!(*ptr.load(), 2);
    }

    #[test]
    fn compare_exchange_fails_on_stale_pointer() {
        let ptr = AtomicSharedPtr::new(1);
        let stale = ptr.load();
        ptr.store(2);
        let result = ptr.compare_exchange(&stale, Arc::new(3));
        assert!(result.is_err());
        assert_eq!(*ptr.load(), 2);
    }
}
