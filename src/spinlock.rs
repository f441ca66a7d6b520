//! Test-and-test-and-set spin-lock.
//!
//! The containers in this crate use [`SpinLock`] only where the design
//! calls for short, bounded critical sections guarded by something cheaper
//! than a kernel mutex (the Lazy list's per-node lock being the main
//! consumer). `lock()` first spins on a relaxed load ("test") before
//! attempting the `swap` ("test-and-set"), so contended waiters don't
//! hammer the cache line with exclusive-ownership requests while the lock
//! is held.
//!
//! In debug builds, [`SpinLock`] additionally records the owning thread and
//! asserts against reentrant acquisition from the same thread, which would
//! otherwise deadlock silently. [`ReentrantSpinLock`] is the variant for
//! call sites that legitimately need to reacquire from the owning thread:
//! it tracks both an owner and a depth counter.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::backoff::Backoff;
use crate::thread_id::{self, NULL_THREAD_ID};

/// A test-and-test-and-set spin-lock.
#[repr(C)]
pub struct SpinLock<T: ?Sized> {
    locked: AtomicBool,
    #[cfg(debug_assertions)]
    owner: core::sync::atomic::AtomicU64,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    /// Creates a new unlocked spin-lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            owner: core::sync::atomic::AtomicU64::new(NULL_THREAD_ID),
            data: UnsafeCell::new(data),
        }
    }

    /// Tries to acquire the lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.locked.swap(true, Ordering::Acquire) {
            None
        } else {
            self.record_owner();
            Some(SpinLockGuard { lock: self })
        }
    }

    /// Acquires the lock, spinning (test-and-test-and-set) if necessary.
    #[inline]
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        self.assert_not_reentrant();
        let mut backoff = Backoff::lock_default();
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                break;
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        self.record_owner();
        SpinLockGuard { lock: self }
    }

    /// Returns whether the lock is currently held.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    #[cfg(debug_assertions)]
    #[inline]
    fn record_owner(&self) {
        self.owner.store(thread_id::current(), Ordering::Relaxed);
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn record_owner(&self) {}

    #[cfg(debug_assertions)]
    #[inline]
    fn assert_not_reentrant(&self) {
        debug_assert_ne!(
            self.owner.load(Ordering::Relaxed),
            thread_id::current(),
            "SpinLock is not reentrant: same thread attempted to lock it twice"
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline]
    fn assert_not_reentrant(&self) {}
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

/// RAII guard for [`SpinLock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    lock: &'a SpinLock<T>,
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        self.lock.owner.store(NULL_THREAD_ID, Ordering::Relaxed);
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// A spin-lock that may be reacquired by its current owner without
/// deadlocking.
///
/// Tracks an owning thread id and a reentrancy depth; the lock is released
/// to other threads only when the depth returns to zero.
#[repr(C)]
pub struct ReentrantSpinLock<T: ?Sized> {
    owner: core::sync::atomic::AtomicU64,
    depth: core::cell::Cell<u32>,
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

impl<T> ReentrantSpinLock<T> {
    /// Creates a new unlocked reentrant spin-lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            owner: core::sync::atomic::AtomicU64::new(NULL_THREAD_ID),
            depth: core::cell::Cell::new(0),
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the lock, spinning if necessary.
    ///
    /// If the calling thread already holds the lock, increments the
    /// reentrancy depth instead of spinning.
    #[inline]
    pub fn lock(&self) -> ReentrantSpinLockGuard<'_, T> {
        let me = thread_id::current();
        if self.owner.load(Ordering::Relaxed) == me && self.locked.load(Ordering::Relaxed) {
            self.depth.set(self.depth.get() + 1);
            return ReentrantSpinLockGuard { lock: self };
        }

        let mut backoff = Backoff::lock_default();
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                break;
            }
            while self.locked.load(Ordering::Relaxed) {
                backoff.spin();
            }
        }
        self.owner.store(me, Ordering::Relaxed);
        self.depth.set(1);
        ReentrantSpinLockGuard { lock: self }
    }

    /// Returns whether the lock is currently held by any thread.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

unsafe impl<T: Send> Send for ReentrantSpinLock<T> {}
unsafe impl<T: Send> Sync for ReentrantSpinLock<T> {}

/// RAII guard for [`ReentrantSpinLock`].
pub struct ReentrantSpinLockGuard<'a, T: ?Sized> {
    lock: &'a ReentrantSpinLock<T>,
}

impl<T: ?Sized> Deref for ReentrantSpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for ReentrantSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReentrantSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        let depth = self.lock.depth.get() - 1;
        self.lock.depth.set(depth);
        if depth == 0 {
            self.lock.owner.store(NULL_THREAD_ID, Ordering::Relaxed);
            self.lock.locked.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_lock_is_unlocked() {
        let lock = SpinLock::new(42);
        assert!(!lock.is_locked());
    }

    #[test]
    fn lock_unlock_round_trips() {
        let lock = SpinLock::new(42);
        {
            let guard = lock.lock();
            assert!(lock.is_locked());
            assert_eq!(*guard, 42);
        }
        assert!(!lock.is_locked());
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = SpinLock::new(42);
        let guard = lock.try_lock();
        assert!(guard.is_some());

        let guard2 = lock.try_lock();
        assert!(guard2.is_none());

        drop(guard);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn modifications_are_observed_across_acquisitions() {
        let lock = SpinLock::new(0);
        *lock.lock() = 42;
        assert_eq!(*lock.lock(), 42);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "not reentrant")]
    fn reentrant_lock_from_same_thread_panics_in_debug() {
        let lock = SpinLock::new(0);
        let _outer = lock.lock();
        let _inner = lock.lock();
    }

    #[test]
    fn reentrant_spinlock_allows_nested_acquisition() {
        let lock = ReentrantSpinLock::new(0);
        let outer = lock.lock();
        assert!(lock.is_locked());
        {
            let mut inner = lock.lock();
            *inner = 7;
        }
        assert!(lock.is_locked());
        drop(outer);
        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 7);
    }
}
