//! TIME: sorted timer queues with callbacks (spec.md §4, "Time/queue").
//!
//! A timer element carries an expiration time, a callback, an argument,
//! a repeat interval, and flags; an element is in at most one queue, and
//! reinsertion preserves sorted order (spec.md glossary, "Timer queue
//! element"). Per spec.md §9's redesign note on pointer graphs, the
//! singly-linked sorted queue is an arena (`Vec<Entry>`) with `u32`
//! index links rather than raw pointers, the same translation applied to
//! [`crate::dbuf`]'s LRU list. `ITIMER` is one such queue per ASID
//! (spec.md §9 "Per-ASID globals"); callers build one [`TimerQueue`] per
//! [`crate::ctx::Asid`] rather than indexing a single global array.

use crate::lock::SpinLock;

const NONE: u32 = u32::MAX;

bitflags::bitflags! {
    pub struct TimerFlags: u8 {
        /// Reinsert at `expiration + repeat` instead of firing once.
        const REPEATING = 0b01;
    }
}

/// A callback invoked when its timer expires, taking the caller-supplied
/// argument. Plain function pointers, mirroring the original's raw
/// callback-address timer elements rather than a boxed closure.
pub type Callback = fn(u32);

struct Entry {
    expiration: u64,
    callback: Callback,
    arg: u32,
    repeat: u64,
    flags: TimerFlags,
    next: u32,
    in_use: bool,
}

/// A handle to a queued timer element, returned by [`TimerQueue::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId(u32);

struct Inner {
    entries: Vec<Entry>,
    head: u32,
    free: Vec<u32>,
}

impl Inner {
    fn alloc(&mut self) -> u32 {
        if let Some(idx) = self.free.pop() {
            return idx;
        }
        self.entries.push(Entry {
            expiration: 0,
            callback: |_| {},
            arg: 0,
            repeat: 0,
            flags: TimerFlags::empty(),
            next: NONE,
            in_use: false,
        });
        (self.entries.len() - 1) as u32
    }

    fn insert_sorted(&mut self, idx: u32) {
        let expiration = self.entries[idx as usize].expiration;
        if self.head == NONE || self.entries[self.head as usize].expiration > expiration {
            self.entries[idx as usize].next = self.head;
            self.head = idx;
            return;
        }
        let mut cur = self.head;
        loop {
            let next = self.entries[cur as usize].next;
            if next == NONE || self.entries[next as usize].expiration > expiration {
                self.entries[idx as usize].next = next;
                self.entries[cur as usize].next = idx;
                return;
            }
            cur = next;
        }
    }

    fn unlink(&mut self, idx: u32) -> bool {
        if self.head == idx {
            self.head = self.entries[idx as usize].next;
            return true;
        }
        let mut cur = self.head;
        while cur != NONE {
            let next = self.entries[cur as usize].next;
            if next == idx {
                self.entries[cur as usize].next = self.entries[idx as usize].next;
                return true;
            }
            cur = next;
        }
        false
    }
}

/// One sorted timer queue.
pub struct TimerQueue {
    inner: SpinLock<Inner>,
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(
                "timerq",
                Inner {
                    entries: Vec::new(),
                    head: NONE,
                    free: Vec::new(),
                },
            ),
        }
    }

    /// Queues `callback(arg)` to fire at `expiration`; if `flags` has
    /// [`TimerFlags::REPEATING`] it is reinserted at `expiration + repeat`
    /// each time it fires.
    pub fn insert(&self, expiration: u64, callback: Callback, arg: u32, repeat: u64, flags: TimerFlags) -> TimerId {
        let mut inner = self.inner.lock();
        let idx = inner.alloc();
        {
            let e = &mut inner.entries[idx as usize];
            e.expiration = expiration;
            e.callback = callback;
            e.arg = arg;
            e.repeat = repeat;
            e.flags = flags;
            e.next = NONE;
            e.in_use = true;
        }
        inner.insert_sorted(idx);
        TimerId(idx)
    }

    /// Removes `id` from the queue if still present. No-op if it already
    /// fired and was not repeating.
    pub fn cancel(&self, id: TimerId) {
        let mut inner = self.inner.lock();
        if inner.unlink(id.0) {
            inner.entries[id.0 as usize].in_use = false;
            inner.free.push(id.0);
        }
    }

    /// Pops and fires every element whose expiration is `<= now`,
    /// reinserting repeating ones at their next expiration. Returns the
    /// number of callbacks invoked.
    pub fn expire_due(&self, now: u64) -> usize {
        let mut fired = Vec::new();
        {
            let mut inner = self.inner.lock();
            while inner.head != NONE && inner.entries[inner.head as usize].expiration <= now {
                let idx = inner.head;
                inner.head = inner.entries[idx as usize].next;
                let (callback, arg, repeat, flags) = {
                    let e = &inner.entries[idx as usize];
                    (e.callback, e.arg, e.repeat, e.flags)
                };
                if flags.contains(TimerFlags::REPEATING) {
                    inner.entries[idx as usize].expiration = now + repeat.max(1);
                    inner.insert_sorted(idx);
                } else {
                    inner.entries[idx as usize].in_use = false;
                    inner.free.push(idx);
                }
                fired.push((callback, arg));
            }
        }
        let n = fired.len();
        for (callback, arg) in fired {
            callback(arg);
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().head == NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static HITS: AtomicU32 = AtomicU32::new(0);
    fn bump(_arg: u32) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn fires_in_expiration_order() {
        let q = TimerQueue::new();
        q.insert(30, bump, 0, 0, TimerFlags::empty());
        q.insert(10, bump, 0, 0, TimerFlags::empty());
        q.insert(20, bump, 0, 0, TimerFlags::empty());
        HITS.store(0, Ordering::SeqCst);
        assert_eq!(q.expire_due(15), 1);
        assert_eq!(q.expire_due(25), 1);
        assert_eq!(q.expire_due(100), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn cancel_removes_before_it_fires() {
        let q = TimerQueue::new();
        let id = q.insert(10, bump, 0, 0, TimerFlags::empty());
        q.cancel(id);
        HITS.store(0, Ordering::SeqCst);
        assert_eq!(q.expire_due(100), 0);
    }

    #[test]
    fn repeating_timer_reinserts() {
        let q = TimerQueue::new();
        q.insert(10, bump, 0, 5, TimerFlags::REPEATING);
        HITS.store(0, Ordering::SeqCst);
        assert_eq!(q.expire_due(10), 1);
        assert!(!q.is_empty());
        assert_eq!(q.expire_due(14), 0);
        assert_eq!(q.expire_due(15), 1);
    }
}
