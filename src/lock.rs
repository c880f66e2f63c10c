// Copyright © 2024 Andrea Corbellini and contributors
// SPDX-License-Identifier: BSD-3-Clause

//! Synchronization policies for [`Pool`](crate::Pool).
//!
//! The policy is picked through the `L` type parameter of `Pool`:
//!
//! * [`SpinLock`] serializes every pool operation across threads, and makes the pool `Sync`;
//! * [`NoLock`] does nothing at all. A pool using it is `Send` but not `Sync`, so the compiler
//!   confines it to one thread at a time.

use spin::Mutex;
use spin::MutexGuard;

/// A mutual-exclusion capability.
///
/// # Safety
///
/// An implementation that also implements [`SyncLock`] must ensure that, between a call to
/// [`acquire`](Self::acquire) and the matching call to [`release`](Self::release), no other
/// thread can return from `acquire`.
pub unsafe trait Lock {
    /// Blocks until the lock is held by the caller.
    fn acquire(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be currently held by the caller, through a previous call to
    /// [`acquire`](Self::acquire).
    unsafe fn release(&self);
}

/// Marker for [`Lock`] policies that provide mutual exclusion across threads.
///
/// # Safety
///
/// See the safety section of [`Lock`].
pub unsafe trait SyncLock: Lock + Sync {}

/// Spinning mutual exclusion.
#[derive(Default, Debug)]
pub struct SpinLock {
    mutex: Mutex<()>,
}

impl SpinLock {
    /// Constructs a new, unlocked `SpinLock`.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mutex: Mutex::new(()),
        }
    }
}

unsafe impl Lock for SpinLock {
    #[inline]
    fn acquire(&self) {
        // The guard is leaked here and the lock is released by `release()` instead
        let _ = MutexGuard::leak(self.mutex.lock());
    }

    #[inline]
    unsafe fn release(&self) {
        unsafe { self.mutex.force_unlock() }
    }
}

unsafe impl SyncLock for SpinLock {}

/// A lock that does nothing, for pools confined to a single thread.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default, Debug)]
pub struct NoLock;

impl NoLock {
    /// Constructs a new `NoLock`.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

unsafe impl Lock for NoLock {
    #[inline]
    fn acquire(&self) {}

    #[inline]
    unsafe fn release(&self) {}
}

/// Holds a [`Lock`] for as long as the guard is alive.
///
/// The lock is acquired by [`new`](Self::new) and released when the guard is dropped, which
/// happens on every exit path of the enclosing scope, unwinding included.
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ScopedGuard<'a, L: Lock> {
    lock: &'a L,
}

impl<'a, L: Lock> ScopedGuard<'a, L> {
    /// Acquires `lock` and returns a guard that will release it.
    #[inline]
    pub fn new(lock: &'a L) -> Self {
        lock.acquire();
        Self { lock }
    }
}

impl<L: Lock> Drop for ScopedGuard<'_, L> {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: the lock was acquired in `new()` and has not been released since
        unsafe { self.lock.release() }
    }
}

#[cfg(test)]
mod tests {
    use super::ScopedGuard;
    use super::SpinLock;
    use std::panic;
    use std::panic::AssertUnwindSafe;

    #[test]
    fn guard_releases_on_drop() {
        let lock = SpinLock::new();
        {
            let _guard = ScopedGuard::new(&lock);
            assert!(lock.mutex.is_locked());
        }
        assert!(!lock.mutex.is_locked());
    }

    #[test]
    fn guard_releases_on_unwind() {
        let lock = SpinLock::new();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _guard = ScopedGuard::new(&lock);
            panic!("unwinding with the lock held");
        }));
        assert!(result.is_err());
        assert!(!lock.mutex.is_locked());
    }
}
