//! Reader-writer lock.
//!
//! A collaborator primitive for code that sits next to the hash table but
//! isn't woven into it: multiple concurrent readers or one exclusive
//! writer, write-biased. Named `acquire_rd`/`acquire_wr` rather than
//! `read`/`write` so the blocking, spinning nature of the call is explicit
//! at the call site.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::backoff::Backoff;

/// Writer bit in the counter.
const WRITER: usize = 1;
/// Increment for reader count.
const READER: usize = 2;

/// A reader-writer lock.
///
/// This lock allows multiple concurrent readers or a single exclusive writer.
/// Writers have priority over new readers (write-biased).
#[repr(C)]
pub struct RwLock<T: ?Sized> {
    state: AtomicUsize,
    data: UnsafeCell<T>,
}

impl<T> RwLock<T> {
    /// Create a new unlocked reader-writer lock.
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Try to acquire a read lock without spinning.
    #[inline]
    pub fn try_acquire_rd(&self) -> Option<RwLockReadGuard<'_, T>> {
        let state = self.state.load(Ordering::Relaxed);
        if state & WRITER != 0 {
            return None;
        }

        let new_state = state + READER;
        if self
            .state
            .compare_exchange(state, new_state, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RwLockReadGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire a read lock, spinning if necessary. Dropping the returned
    /// guard is `release_rd`.
    #[inline]
    pub fn acquire_rd(&self) -> RwLockReadGuard<'_, T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_acquire_rd() {
                return guard;
            }
            backoff.spin();
        }
    }

    /// Try to acquire a write lock without spinning.
    #[inline]
    pub fn try_acquire_wr(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(RwLockWriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Acquire a write lock, spinning if necessary. Dropping the returned
    /// guard is `release_wr`.
    #[inline]
    pub fn acquire_wr(&self) -> RwLockWriteGuard<'_, T> {
        let mut backoff = Backoff::new();
        loop {
            if let Some(guard) = self.try_acquire_wr() {
                return guard;
            }
            backoff.spin();
        }
    }

    /// Check if the lock is currently held for writing.
    #[inline]
    pub fn is_locked_exclusive(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    /// Get the current reader count.
    #[inline]
    pub fn reader_count(&self) -> usize {
        self.state.load(Ordering::Relaxed) / READER
    }
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

/// RAII read guard for RwLock.
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(READER, Ordering::Release);
    }
}

/// RAII write guard for RwLock.
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T: ?Sized> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_and(!WRITER, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new() {
        let lock = RwLock::new(42);
        assert!(!lock.is_locked_exclusive());
        assert_eq!(lock.reader_count(), 0);
    }

    #[test]
    fn test_read() {
        let lock = RwLock::new(42);
        let guard = lock.acquire_rd();
        assert_eq!(*guard, 42);
        assert_eq!(lock.reader_count(), 1);
    }

    #[test]
    fn test_multiple_reads() {
        let lock = RwLock::new(42);
        let g1 = lock.acquire_rd();
        let g2 = lock.acquire_rd();
        let g3 = lock.acquire_rd();

        assert_eq!(lock.reader_count(), 3);
        assert_eq!(*g1, 42);
        assert_eq!(*g2, 42);
        assert_eq!(*g3, 42);
    }

    #[test]
    fn test_write() {
        let lock = RwLock::new(0);

        {
            let mut guard = lock.acquire_wr();
            *guard = 42;
            assert!(lock.is_locked_exclusive());
        }

        let guard = lock.acquire_rd();
        assert_eq!(*guard, 42);
    }

    #[test]
    fn test_try_read_while_writing() {
        let lock = RwLock::new(42);
        let _write = lock.acquire_wr();

        assert!(lock.try_acquire_rd().is_none());
    }

    #[test]
    fn test_try_write_while_reading() {
        let lock = RwLock::new(42);
        let _read = lock.acquire_rd();

        assert!(lock.try_acquire_wr().is_none());
    }
}
