//! RCU-published pointers.
//!
//! [`RcuCell`] is the publication side of the protocol: writers install a
//! new version with a release store (preceded by a full fence when the
//! value is non-null), readers pick it up inside a read-side critical
//! section with a consume-strength load, expressed here as acquire — Rust
//! has no consume ordering, and acquire is the sound mapping.
//!
//! The grace-period engine itself never dereferences published data; it
//! only guarantees that after `synchronize` returns, no reader still holds
//! a version replaced before the call.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::barrier::smp_mb;

/// A shared slot holding the current published version of a `T`.
///
/// The cell does not own what it points to: writers are responsible for
/// reclaiming a replaced version, and only after a grace period.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
    _owns: PhantomData<*mut T>,
}

// SAFETY: all slot access is through atomics; the data behind the pointer
// is shared read-only with readers, so T must be Send + Sync.
unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    /// An empty cell (null pointer).
    pub const fn new() -> Self {
        Self {
            ptr: AtomicPtr::new(core::ptr::null_mut()),
            _owns: PhantomData,
        }
    }

    /// Consume-load the current version.
    ///
    /// The returned pointer is only stable inside a read-side critical
    /// section; outside one, a concurrent writer may reclaim it at any
    /// time.
    pub fn load(&self) -> *mut T {
        self.ptr.load(Ordering::Acquire)
    }

    /// Dereference the current version.
    ///
    /// # Safety
    ///
    /// The caller must be inside a read-side critical section entered
    /// before this call, and the returned reference must not outlive it.
    pub unsafe fn deref(&self) -> Option<&T> {
        let p = self.load();
        if p.is_null() {
            None
        } else {
            // SAFETY: non-null published pointers are valid for the length
            // of the surrounding read-side critical section.
            Some(unsafe { &*p })
        }
    }

    /// Publish `new`, returning the replaced version for reclamation after
    /// a grace period.
    ///
    /// A non-null publication is preceded by a full fence so every
    /// initialization store to the new version is visible before the
    /// pointer is.
    pub fn swap(&self, new: *mut T) -> *mut T {
        if !new.is_null() {
            smp_mb();
        }
        self.ptr.swap(new, Ordering::AcqRel)
    }

    /// Publish `new` and discard the old pointer. For slots whose previous
    /// version is reclaimed elsewhere (or was null).
    pub fn store(&self, new: *mut T) {
        let _ = self.swap(new);
    }
}

impl<T> Default for RcuCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cell_is_null() {
        let cell: RcuCell<u64> = RcuCell::new();
        assert!(cell.load().is_null());
        unsafe {
            assert!(cell.deref().is_none());
        }
    }

    #[test]
    fn swap_returns_the_replaced_version() {
        let cell: RcuCell<u64> = RcuCell::new();
        let v1 = Box::into_raw(Box::new(10u64));
        let v2 = Box::into_raw(Box::new(20u64));

        assert!(cell.swap(v1).is_null());
        assert_eq!(cell.swap(v2), v1);
        unsafe {
            assert_eq!(*cell.deref().unwrap(), 20);
            drop(Box::from_raw(v1));
            drop(Box::from_raw(cell.swap(core::ptr::null_mut())));
        }
        assert!(cell.load().is_null());
    }

    #[test]
    fn store_discards_previous_pointer() {
        let cell: RcuCell<u64> = RcuCell::new();
        let v = Box::into_raw(Box::new(7u64));
        cell.store(v);
        assert_eq!(cell.load(), v);
        unsafe {
            drop(Box::from_raw(cell.swap(core::ptr::null_mut())));
        }
    }

    #[test]
    fn published_value_is_readable_across_threads() {
        use std::sync::Arc;
        let cell = Arc::new(RcuCell::<u64>::new());
        let v = Box::into_raw(Box::new(99u64));
        cell.store(v);

        let reader = {
            let cell = Arc::clone(&cell);
            std::thread::spawn(move || {
                let p = cell.load();
                assert!(!p.is_null());
                // SAFETY: the pointer is never reclaimed in this test.
                unsafe { *p }
            })
        };
        assert_eq!(reader.join().expect("reader thread"), 99);
        unsafe {
            drop(Box::from_raw(cell.swap(core::ptr::null_mut())));
        }
    }
}
