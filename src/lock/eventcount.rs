//! Monotonic event counts with wait-for-value-≥ semantics.
//!
//! spec.md §4.1 / §9: an event count differs from a condition variable in
//! that a wait records a *target value*, not a predicate, so an advance
//! that happens between a reader's load and its wait can never be missed.
//! The teacher's closest analogue is `WaitChannel`
//! (`kernel-rs/src/proc/wait_channel.rs`), which wakes every sleeper on
//! `wakeup()` regardless of what each one is waiting for; an `EventCount`
//! refines that by recording the value a waiter needs so it can tell
//! whether *this* advance was the one it was waiting for.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A fetch-and-add counter with a multi-wait primitive.
#[derive(Debug)]
pub struct EventCount {
    value: Mutex<u32>,
    condvar: Condvar,
}

/// Poll interval used by [`EventCount::wait_n`] while checking the other
/// event counts in the wait set. Keeps the multi-wait correct without
/// requiring a single OS primitive that can block on several condvars at
/// once.
const POLL_INTERVAL: Duration = Duration::from_millis(2);

impl EventCount {
    pub const fn new() -> Self {
        Self {
            value: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    /// Zeroes the counter.
    pub fn init(&self) {
        let mut v = self.value.lock().unwrap();
        *v = 0;
    }

    /// Current value.
    pub fn read(&self) -> u32 {
        *self.value.lock().unwrap()
    }

    /// Atomically increments the counter and wakes every thread whose
    /// target is now satisfied.
    pub fn advance(&self) -> u32 {
        let mut v = self.value.lock().unwrap();
        *v = v.wrapping_add(1);
        let new_value = *v;
        drop(v);
        self.condvar.notify_all();
        new_value
    }

    /// Blocks until `self.read() >= target`.
    pub fn wait(&self, target: u32) {
        let guard = self.value.lock().unwrap();
        let _unused = self
            .condvar
            .wait_while(guard, |v| *v < target)
            .unwrap();
    }

    /// Blocks until `self.read() >= target`, or `timeout` elapses first.
    /// Returns `true` if satisfied, `false` on timeout.
    pub fn wait_timeout(&self, target: u32, timeout: Duration) -> bool {
        let guard = self.value.lock().unwrap();
        let (guard, _result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |v| *v < target)
            .unwrap();
        *guard >= target
    }
}

impl Default for EventCount {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks until some `ecs[i].read() >= targets[i]`, returning that index.
/// `ecs` and `targets` must have the same length (the "bounded" `wait_n`
/// of spec.md §4.1 — in safe Rust the array length bound is just the
/// slice length, no separate count parameter is needed).
pub fn wait_n(ecs: &[&EventCount], targets: &[u32]) -> usize {
    assert_eq!(ecs.len(), targets.len());
    assert!(!ecs.is_empty());
    loop {
        for (i, ec) in ecs.iter().enumerate() {
            if ec.read() >= targets[i] {
                return i;
            }
        }
        // No event count was already satisfied; wait on the first one with
        // a short timeout so advances on the others are re-checked promptly.
        ecs[0].wait_timeout(targets[0], POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn advance_wakes_waiter() {
        let ec = Arc::new(EventCount::new());
        let ec2 = Arc::clone(&ec);
        let handle = thread::spawn(move || {
            ec2.wait(1);
        });
        thread::sleep(Duration::from_millis(10));
        ec.advance();
        handle.join().unwrap();
    }

    #[test]
    fn wait_n_returns_satisfied_index() {
        let a = EventCount::new();
        let b = EventCount::new();
        b.advance();
        b.advance();
        let idx = wait_n(&[&a, &b], &[5, 2]);
        assert_eq!(idx, 1);
    }

    #[test]
    fn missed_advance_is_impossible() {
        // A reader that sees value v then waits on v+1 must wake on the
        // very next advance.
        let ec = Arc::new(EventCount::new());
        let v = ec.read();
        ec.advance();
        assert!(ec.wait_timeout(v + 1, Duration::from_millis(50)));
    }
}
