//! Spin-based locking for the allocator's shared tiers.
//!
//! `std::sync::Mutex` may allocate on first contention, which would recurse
//! into the allocator being built. `SpinMutex` is a spinlock with an RAII
//! guard, const-constructible so it can live in statics.
//!
//! Acquisition is swap-based test-and-test-and-set: a failed swap backs off
//! with an exponentially growing pause, then watches the flag with plain
//! loads until it clears before swapping again. Critical sections here are
//! short (list surgery, one map write), so bounded backoff beats parking.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// Longest backoff burst, in spin hints, before re-probing the flag.
const BACKOFF_LIMIT: u32 = 64;

/// A spinning mutex. Never allocates.
pub struct SpinMutex<T> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        let mut pause = 1u32;
        while self.held.swap(true, Ordering::Acquire) {
            for _ in 0..pause {
                core::hint::spin_loop();
            }
            if pause < BACKOFF_LIMIT {
                pause <<= 1;
            }
            // Watch without writing until the holder lets go, so waiters
            // do not keep stealing the line from each other.
            while self.held.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
        SpinMutexGuard {
            held: &self.held,
            value: self.value.get(),
        }
    }

    /// Acquire the lock only if it is currently free.
    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.held.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(SpinMutexGuard {
                held: &self.held,
                value: self.value.get(),
            })
        }
    }
}

/// RAII guard for [`SpinMutex`]; releases the flag on drop.
pub struct SpinMutexGuard<'a, T> {
    held: &'a AtomicBool,
    value: *mut T,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // The flag was won in `lock`/`try_lock` and is not released until
        // this guard drops, so the value pointer is exclusive.
        unsafe { &*self.value }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.value }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.held.store(false, Ordering::Release);
    }
}
