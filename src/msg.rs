//! Message layer: per-ASID socket ownership (spec.md §4.5 MSG half).
//!
//! Layered on top of [`crate::sock::Sock`]: a 64-bit bitmap per socket
//! says which address spaces currently hold a reference, mirroring how
//! the teacher tracks open-file-descriptor ownership per process but
//! without a process table — just the bitmap, since [`Asid`] is this
//! crate's whole notion of "process identity" (see [`crate::ctx`]).

use std::time::Duration;

use crate::clock::Clock;
use crate::ctx::{Asid, QuitTable};
use crate::lock::ExclLock;
use crate::param::{MAX_ASID, NSOCK};
use crate::sock::{Packet, PutFlags, Sock};
use crate::status::{Result, Status};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

struct Ownership {
    owners: u64,
    depth: u32,
}

impl Ownership {
    fn empty() -> Self {
        Self { owners: 0, depth: 0 }
    }
}

/// What woke up a [`Msg::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    PacketReady,
    TimedOut,
    QuitSignalled,
}

/// Per-ASID ownership tracking for every socket (spec.md §5: "MSG socket
/// ownership table" is a sleeping [`ExclLock`]).
pub struct Msg {
    ownership: ExclLock<Vec<Ownership>>,
}

impl Default for Msg {
    fn default() -> Self {
        Self::new()
    }
}

impl Msg {
    pub fn new() -> Self {
        let mut v = Vec::with_capacity(NSOCK);
        for _ in 0..NSOCK {
            v.push(Ownership::empty());
        }
        Self {
            ownership: ExclLock::new("msg_ownership", v),
        }
    }

    /// Requires the socket's ownership bitmap to be zero; sets the
    /// current ASID's bit and records `depth`.
    pub fn open_msg(&self, n: u16, asid: Asid, depth: u32) -> Result<()> {
        assert!((asid as usize) < MAX_ASID, "asid out of range");
        let mut table = self.ownership.lock();
        let slot = &mut table[n as usize];
        if slot.owners != 0 {
            return Err(Status::AlreadyOwned);
        }
        slot.owners = 1u64 << asid;
        slot.depth = depth;
        Ok(())
    }

    /// Clears only `asid`'s bit; once the bitmap reaches zero the
    /// underlying socket is actually closed.
    pub fn close_msg(&self, sock: &Sock, n: u16, asid: Asid) {
        let mut table = self.ownership.lock();
        let slot = &mut table[n as usize];
        slot.owners &= !(1u64 << asid);
        let now_empty = slot.owners == 0;
        drop(table);
        if now_empty {
            sock.close(n);
        }
    }

    /// For every socket the parent owns, grants the child a reference
    /// too (spec.md §4.5 "On `fork`").
    pub fn fork(&self, parent: Asid, child: Asid) {
        let mut table = self.ownership.lock();
        let parent_bit = 1u64 << parent;
        let child_bit = 1u64 << child;
        for slot in table.iter_mut() {
            if slot.owners & parent_bit != 0 {
                slot.owners |= child_bit;
            }
        }
    }

    /// Closes every socket `asid` owns (spec.md §4.5 "On ASID exit").
    pub fn exit(&self, sock: &Sock, asid: Asid) {
        let bit = 1u64 << asid;
        let to_close: Vec<u16> = {
            let mut table = self.ownership.lock();
            let mut closed = Vec::new();
            for (n, slot) in table.iter_mut().enumerate() {
                if slot.owners & bit != 0 {
                    slot.owners &= !bit;
                    if slot.owners == 0 {
                        closed.push(n as u16);
                    }
                }
            }
            closed
        };
        for n in to_close {
            sock.close(n);
        }
    }

    pub fn is_owned(&self, n: u16) -> bool {
        self.ownership.lock()[n as usize].owners != 0
    }

    /// Waits for a packet on `n`, the clock (timeout), or `asid`'s quit
    /// event count — whichever comes first (spec.md §4.5 "Wait", §5
    /// "Cancellation").
    pub fn wait(&self, sock: &Sock, clock: &dyn Clock, quit: &QuitTable, n: u16, asid: Asid, timeout_ticks: u64) -> WaitOutcome {
        let quit_target = quit.next_target(asid);
        let deadline = clock.abs_clock().saturating_add(timeout_ticks);
        loop {
            if sock.queue_len(n) > 0 {
                return WaitOutcome::PacketReady;
            }
            if quit.ec(asid).read() >= quit_target {
                quit.latch(asid);
                return WaitOutcome::QuitSignalled;
            }
            if clock.abs_clock() >= deadline {
                return WaitOutcome::TimedOut;
            }
            sock.with_ec(n, |ec| {
                let target = ec.read() + 1;
                ec.wait_timeout(target, POLL_INTERVAL)
            });
        }
    }

    /// Sends `request` on `n`, then waits for and returns the matching
    /// reply, so a client can request/respond without a second lock
    /// layer (spec.md §4.5 "Send-and-receive").
    pub fn sar(
        &self,
        sock: &Sock,
        clock: &dyn Clock,
        quit: &QuitTable,
        n: u16,
        asid: Asid,
        request: Packet,
        flags: PutFlags,
        hdr1: u16,
        hdr2: u16,
        timeout_ticks: u64,
    ) -> Result<Packet> {
        sock.put(n, request, flags, hdr1, hdr2)?;
        match self.wait(sock, clock, quit, n, asid, timeout_ticks) {
            WaitOutcome::PacketReady => sock.get(n).ok_or(Status::TimedOut),
            WaitOutcome::TimedOut => Err(Status::TimedOut),
            WaitOutcome::QuitSignalled => Err(Status::QuitSignalled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    #[test]
    fn open_msg_requires_zero_bitmap() {
        let msg = Msg::new();
        msg.open_msg(10, 0, 4).unwrap();
        assert!(matches!(msg.open_msg(10, 1, 4), Err(Status::AlreadyOwned)));
    }

    #[test]
    fn close_msg_only_clears_own_bit() {
        let sock = Sock::new();
        sock.open(10, 1, 100, 4).unwrap();
        let msg = Msg::new();
        msg.open_msg(10, 0, 4).unwrap();
        msg.fork(0, 1);
        msg.close_msg(&sock, 10, 0);
        assert!(msg.is_owned(10));
        msg.close_msg(&sock, 10, 1);
        assert!(!msg.is_owned(10));
    }

    #[test]
    fn exit_closes_every_owned_socket() {
        let sock = Sock::new();
        sock.open(11, 1, 100, 4).unwrap();
        sock.open(12, 1, 100, 4).unwrap();
        let msg = Msg::new();
        msg.open_msg(11, 3, 4).unwrap();
        msg.open_msg(12, 3, 4).unwrap();
        msg.exit(&sock, 3);
        assert!(!sock.is_allocated(11));
        assert!(!sock.is_allocated(12));
    }

    #[test]
    fn quit_wakes_wait_with_latched_value() {
        let sock = Sock::new();
        sock.open(13, 1, 100, 4).unwrap();
        let msg = Msg::new();
        let clock = FakeClock::new();
        let quit = QuitTable::new();
        quit.signal(4);
        let outcome = msg.wait(&sock, &clock, &quit, 13, 4, 1000);
        assert_eq!(outcome, WaitOutcome::QuitSignalled);
        // A second wait should not immediately re-trigger on the same signal.
        let outcome2 = msg.wait(&sock, &clock, &quit, 13, 4, 0);
        assert_eq!(outcome2, WaitOutcome::TimedOut);
    }
}
