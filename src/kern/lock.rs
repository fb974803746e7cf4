//! Thread Locks
//!
//! Every execution context carries one lock guarding its IPC state against a
//! second context or an interrupt. The discipline is strict acquire-then-
//! release: a guard is never held across a call into the scheduler, and code
//! never holds two thread locks at once.

use spin::{Mutex, MutexGuard};

// ============================================================================
// Thread Lock
// ============================================================================

/// Lock protecting a thread's IPC state
pub struct ThreadLock<T> {
    inner: Mutex<T>,
}

/// Guard returned by [`ThreadLock::lock`]
pub type ThreadLockGuard<'a, T> = MutexGuard<'a, T>;

impl<T> ThreadLock<T> {
    /// Create a new unlocked thread lock
    pub const fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(data),
        }
    }

    /// Acquire the lock, spinning until available
    pub fn lock(&self) -> ThreadLockGuard<'_, T> {
        self.inner.lock()
    }

    /// Check if the lock is held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: core::fmt::Debug> core::fmt::Debug for ThreadLock<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ThreadLock")
            .field("locked", &self.is_locked())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_lock() {
        let lock = ThreadLock::new(42);
        assert!(!lock.is_locked());

        {
            let mut guard = lock.lock();
            assert!(lock.is_locked());
            *guard = 100;
        }

        assert!(!lock.is_locked());
        assert_eq!(*lock.lock(), 100);
    }
}
