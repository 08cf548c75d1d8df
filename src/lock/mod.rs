//! Event counts and locks (spec.md §4.1).
//!
//! Three kinds of synchronization primitive, per spec.md §5:
//!
//! * [`SpinLock`] — "must not suspend"; acquire returns a saved-state
//!   token, the hosted analogue of the teacher's `push_off`/`pop_off`
//!   interrupt-disable pair (`kernel-rs/src/lock/spinlock.rs`).
//! * [`ExclLock`] — sleeping, used for BAT/DISK/HINT/MSG-table-sized
//!   critical sections (`kernel-rs/src/lock/sleeplock.rs`).
//! * [`EventCount`] — not mutual exclusion; signals waiters of progress
//!   (`kernel-rs/src/proc/wait_channel.rs` plays the same role for the
//!   teacher's scheduler-integrated sleep/wakeup).

mod eventcount;
mod excl;
mod spinlock;

pub use eventcount::EventCount;
pub use excl::{ExclLock, ExclLockGuard};
pub use spinlock::{InterruptToken, SpinLock, SpinLockGuard};
