//! Spin locks returning saved-interrupt tokens.
//!
//! The teacher's `RawSpinlock` (`kernel-rs/src/lock/spinlock.rs`) disables
//! interrupts on `acquire()` via `push_off()`, and restores them on
//! `release()` via `pop_off()`; `push_off`/`pop_off` are themselves
//! matched like a stack so nested acquires leave interrupts off until the
//! outermost lock releases. On a hosted target there is no real interrupt
//! controller, so we keep the exact bookkeeping (a per-thread nesting
//! counter and a saved "interrupts enabled" flag) against a simulated
//! flag, which is what spec.md §1 asks for: the hardware hook is an
//! external collaborator, the token discipline is not.

use std::cell::Cell;
use std::sync::{Mutex, MutexGuard};

thread_local! {
    /// Simulated hardware interrupt-enabled flag.
    static INTR_HW: Cell<bool> = Cell::new(true);
    /// What `INTR_HW` was before the outermost `push_off`, restored by the
    /// matching outermost `pop_off` (mirrors `Cpu::interrupt_enabled`).
    static INTR_SAVED: Cell<bool> = Cell::new(true);
    /// Nesting depth (mirrors `Cpu::noff`).
    static INTR_NOFF: Cell<u32> = Cell::new(0);
}

/// Saved-interrupt-state token returned by [`SpinLock::lock`] /
/// produced by [`push_off`]. Restoring it (via `Drop` or explicit
/// [`pop_off`]) undoes exactly one `push_off`.
#[derive(Debug)]
pub struct InterruptToken {
    _private: (),
}

/// Disables the simulated interrupt flag, saving the previous state the
/// first time this is called at nesting depth zero. Pairs with [`pop_off`].
pub fn push_off() -> InterruptToken {
    let depth = INTR_NOFF.with(Cell::get);
    if depth == 0 {
        let was_enabled = INTR_HW.with(Cell::get);
        INTR_SAVED.with(|c| c.set(was_enabled));
    }
    INTR_HW.with(|c| c.set(false));
    INTR_NOFF.with(|c| c.set(depth + 1));
    InterruptToken { _private: () }
}

/// Undoes one [`push_off`]; once the nesting count reaches zero, restores
/// whatever the interrupt-enabled state was before the first `push_off`.
pub fn pop_off(token: InterruptToken) {
    drop(token);
}

impl Drop for InterruptToken {
    fn drop(&mut self) {
        let depth = INTR_NOFF.with(Cell::get);
        assert!(depth >= 1, "pop_off: not holding any spin lock");
        INTR_NOFF.with(|c| c.set(depth - 1));
        if depth == 1 {
            let saved = INTR_SAVED.with(Cell::get);
            INTR_HW.with(|c| c.set(saved));
        }
    }
}

/// A mutual-exclusion lock meant for short critical sections that never
/// sleep: DBUF's cache list, NETBUF's free lists, the SOCK table, and
/// HINT's in-memory cache (spec.md §5).
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    inner: Mutex<T>,
}

/// Guard returned by [`SpinLock::lock`]; releases the lock and restores
/// the interrupt token when dropped.
#[derive(Debug)]
pub struct SpinLockGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    _token: InterruptToken,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            inner: Mutex::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, disabling (simulated) interrupts for the
    /// duration of the returned guard's lifetime.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let token = push_off();
        let guard = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        SpinLockGuard {
            guard,
            _token: token,
        }
    }
}

impl<T> std::ops::Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> std::ops::DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_push_off_restores_on_last_pop() {
        assert!(INTR_HW.with(Cell::get));
        let t1 = push_off();
        let t2 = push_off();
        assert!(!INTR_HW.with(Cell::get));
        drop(t2);
        assert!(!INTR_HW.with(Cell::get));
        drop(t1);
        assert!(INTR_HW.with(Cell::get));
    }

    #[test]
    fn spinlock_mutates_under_lock() {
        let lock = SpinLock::new("test", 0u32);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }
}
