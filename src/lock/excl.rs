//! Sleeping exclusion locks.
//!
//! Used for BAT's single per-system lock, the DISK mount table, the HINT
//! file, the RPC server socket, and the MSG ownership table (spec.md §5).
//! On a hosted target a sleeping lock is just `std::sync::Mutex`; the
//! teacher's `Sleeplock`/`Sleepablelock` (`kernel-rs/src/lock/sleeplock.rs`,
//! `sleepablelock.rs`) make the same simplification relative to
//! `RawSpinlock`, since they are explicitly allowed to deschedule the
//! caller rather than spin.

use std::sync::{Mutex, MutexGuard};

#[derive(Debug)]
pub struct ExclLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

#[derive(Debug)]
pub struct ExclLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
}

impl<T> ExclLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks the caller's thread until the lock is free.
    pub fn lock(&self) -> ExclLockGuard<'_, T> {
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ExclLockGuard { guard }
    }
}

impl<T> std::ops::Deref for ExclLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for ExclLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_access() {
        let lock = ExclLock::new("bat", 0u32);
        *lock.lock() += 1;
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 2);
    }
}
