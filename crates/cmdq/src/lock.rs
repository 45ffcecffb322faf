//! # Process Lock
//!
//! Single-owner advisory lock serializing dispatcher passes and queue-list
//! changes.
//!
//! The dispatcher never waits for this lock. Every caller raises the
//! reprocess flag before trying the lock. A dispatching holder clears the
//! flag at the start of every pass, keeps passing while it is raised, and
//! checks it again after unlocking, so a request that loses the race against
//! a dispatcher is always served by it.
//!
//! Queue-list changes and inspection take the lock with
//! [`lock_blocking`](ProcessLock::lock_blocking) and never look at the flag.
//! A request raised while one of those holds the lock stays pending until
//! the next `process_queues` call.

use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use helix_cmdq_core::CallerId;
use spin::{Mutex, MutexGuard};

/// Advisory lock with caller identity and a reprocess flag
pub struct ProcessLock<T> {
    inner: Mutex<T>,
    reprocess: AtomicBool,
}

impl<T> ProcessLock<T> {
    /// Create an unlocked lock
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
            reprocess: AtomicBool::new(false),
        }
    }

    /// Request a pass and take the lock if it is free
    ///
    /// Returns `None` if another context holds the lock; that holder will
    /// run the requested pass.
    pub fn try_lock_or_flag(&self, caller: CallerId) -> Option<ProcessGuard<'_, T>> {
        // Flag first: the holder checks it after unlocking
        self.reprocess.store(true, Ordering::SeqCst);
        match self.inner.try_lock() {
            Some(guard) => Some(ProcessGuard { guard, caller }),
            None => {
                log::trace!("ProcessLock: {:?} found lock held, reprocess flagged", caller);
                None
            },
        }
    }

    /// Spin until the lock is free
    pub fn lock_blocking(&self, caller: CallerId) -> ProcessGuard<'_, T> {
        ProcessGuard {
            guard: self.inner.lock(),
            caller,
        }
    }

    /// Clear the reprocess flag, returning whether it was raised
    pub fn take_reprocess(&self) -> bool {
        self.reprocess.swap(false, Ordering::SeqCst)
    }

    /// Reprocess flag is raised
    pub fn reprocess_requested(&self) -> bool {
        self.reprocess.load(Ordering::SeqCst)
    }

    /// Lock is currently held
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: Default> Default for ProcessLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for ProcessLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLock")
            .field("locked", &self.is_locked())
            .field("reprocess", &self.reprocess_requested())
            .finish()
    }
}

/// Holder of the process lock
pub struct ProcessGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    caller: CallerId,
}

impl<T> ProcessGuard<'_, T> {
    /// Identity that took the lock
    pub fn caller(&self) -> CallerId {
        self.caller
    }
}

impl<T> Deref for ProcessGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for ProcessGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> fmt::Debug for ProcessGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessGuard")
            .field("caller", &self.caller)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use helix_cmdq_core::ProcessId;

    #[test]
    fn test_contention_flags_reprocess() {
        let lock = ProcessLock::new(0u32);
        let guard = lock.try_lock_or_flag(CallerId::Kernel).unwrap();
        assert_eq!(guard.caller(), CallerId::Kernel);
        // The holder clears its own request when it starts a pass
        assert!(lock.take_reprocess());
        assert!(!lock.reprocess_requested());

        assert!(lock.try_lock_or_flag(CallerId::Isr).is_none());
        assert!(lock.reprocess_requested());
        drop(guard);

        assert!(lock.take_reprocess());
        assert!(!lock.take_reprocess());
    }

    #[test]
    fn test_guard_gives_access() {
        let lock = ProcessLock::new(alloc::vec![1u32]);
        {
            let mut guard = lock.lock_blocking(CallerId::Process(ProcessId(3)));
            guard.push(2);
            assert!(lock.is_locked());
        }
        assert!(!lock.is_locked());
        assert!(!lock.reprocess_requested());
        let guard = lock.try_lock_or_flag(CallerId::Isr).unwrap();
        assert_eq!(*guard, alloc::vec![1, 2]);
    }
}
