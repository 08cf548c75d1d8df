//! Socket layer (spec.md §4.5 SOCK half).
//!
//! A fixed table of [`NSOCK`] descriptors, well-known numbers `1..32`
//! claimed by [`Sock::open`] and dynamic numbers `32..224` handed out by
//! [`Sock::allocate`] from a free list — the same split the teacher draws
//! between reserved low file descriptors and a dynamically assigned
//! range, just applied to socket numbers instead. Each socket's queue is
//! an owned `VecDeque<Packet>` rather than an intrusive pointer list:
//! packets move in and out by value, so there is no persistent link
//! structure for spec.md §9's arena-plus-index advice to apply to.

use std::collections::VecDeque;

use crate::lock::{EventCount, SpinLock};
use crate::netpkt::PacketMeta;
use crate::param::{BSIZE, NSOCK, SOCK_DYNAMIC_BASE};
use crate::status::{Result, Status};

bitflags::bitflags! {
    pub struct PutFlags: u8 {
        /// Auto-open the socket (with caller-supplied protocol/queue
        /// depth) if it is not already allocated.
        const NEEDS_OPEN = 0b01;
    }
}

/// One network buffer queued on a socket: a header buffer (carrying the
/// fixed-offset trailer, spec.md §6) plus its payload data pages.
#[derive(Debug, Clone)]
pub struct Packet {
    pub header: Box<[u8; BSIZE]>,
    pub data_pages: Vec<Box<[u8; BSIZE]>>,
    pub data_len: u32,
}

struct Slot {
    allocated: bool,
    protocol: u8,
    max_queue: u32,
    queue_depth: usize,
    queue: VecDeque<Packet>,
    ec: EventCount,
}

impl Slot {
    fn empty() -> Self {
        Self {
            allocated: false,
            protocol: 0,
            max_queue: 0,
            queue_depth: 0,
            queue: VecDeque::new(),
            ec: EventCount::new(),
        }
    }
}

/// The socket table. Mutations are serialized by one [`SpinLock`]
/// (spec.md §5: "SOCK table" is spin-locked, short critical sections
/// only — no I/O happens under it).
pub struct Sock {
    table: SpinLock<Vec<Slot>>,
    free_dynamic: SpinLock<VecDeque<u16>>,
}

impl Default for Sock {
    fn default() -> Self {
        Self::new()
    }
}

impl Sock {
    pub fn new() -> Self {
        let mut table = Vec::with_capacity(NSOCK);
        for _ in 0..NSOCK {
            table.push(Slot::empty());
        }
        let free_dynamic = (SOCK_DYNAMIC_BASE..NSOCK as u16).collect();
        Self {
            table: SpinLock::new("sock_table", table),
            free_dynamic: SpinLock::new("sock_free", free_dynamic),
        }
    }

    /// Claims a well-known socket number (`1..SOCK_DYNAMIC_BASE`).
    pub fn open(&self, n: u16, protocol: u8, max_queue: u32, queue_depth: usize) -> Result<()> {
        if n == 0 || n >= SOCK_DYNAMIC_BASE {
            return Err(Status::InvalidBlock);
        }
        let mut table = self.table.lock();
        let slot = &mut table[n as usize];
        if slot.allocated {
            return Err(Status::AlreadyOwned);
        }
        slot.allocated = true;
        slot.protocol = protocol;
        slot.max_queue = max_queue;
        slot.queue_depth = queue_depth;
        Ok(())
    }

    /// Hands out a dynamic socket number.
    pub fn allocate(&self, protocol: u8, max_queue: u32, queue_depth: usize) -> Result<u16> {
        let n = self
            .free_dynamic
            .lock()
            .pop_front()
            .ok_or(Status::NoSocketsAvailable)?;
        let mut table = self.table.lock();
        let slot = &mut table[n as usize];
        slot.allocated = true;
        slot.protocol = protocol;
        slot.max_queue = max_queue;
        slot.queue_depth = queue_depth;
        Ok(n)
    }

    pub fn close(&self, n: u16) {
        let mut table = self.table.lock();
        table[n as usize] = Slot::empty();
        drop(table);
        if n >= SOCK_DYNAMIC_BASE {
            self.free_dynamic.lock().push_back(n);
        }
    }

    /// Enqueues `pkt` on `n`'s queue, stamping `hdr1`/`hdr2` into the
    /// header trailer's EC-param fields (spec.md §4.5, §6).
    pub fn put(&self, n: u16, mut pkt: Packet, flags: PutFlags, hdr1: u16, hdr2: u16) -> Result<()> {
        let mut table = self.table.lock();
        let slot = &mut table[n as usize];
        if !slot.allocated {
            if flags.contains(PutFlags::NEEDS_OPEN) {
                slot.allocated = true;
                slot.max_queue = pkt.data_len.max(slot.max_queue);
                slot.queue_depth = slot.queue_depth.max(8);
            } else {
                return Err(Status::SocketNotAllocated);
            }
        }
        if slot.max_queue != 0 && pkt.data_len > slot.max_queue {
            return Err(Status::PacketTooLarge);
        }
        if slot.queue.len() >= slot.queue_depth {
            return Err(Status::QueueFull);
        }

        let mut meta = PacketMeta::read_from(&pkt.header);
        meta.ec_param1 = hdr1;
        meta.ec_param2 = hdr2;
        meta.data_len = pkt.data_len;
        meta.write_to(&mut pkt.header);

        slot.queue.push_back(pkt);
        slot.ec.advance();
        Ok(())
    }

    /// Pops the head of `n`'s queue, or `None` if empty. Does not block;
    /// callers that want to wait use [`Sock::event_count`] plus
    /// [`crate::lock::eventcount::wait_n`].
    pub fn get(&self, n: u16) -> Option<Packet> {
        self.table.lock()[n as usize].queue.pop_front()
    }

    pub fn queue_len(&self, n: u16) -> usize {
        self.table.lock()[n as usize].queue.len()
    }

    pub fn is_allocated(&self, n: u16) -> bool {
        self.table.lock()[n as usize].allocated
    }

    /// Runs `f` with a reference to socket `n`'s event count (spec.md
    /// §4.5 "Wait"), under the table lock just long enough to fetch it.
    pub fn with_ec<R>(&self, n: u16, f: impl FnOnce(&EventCount) -> R) -> R {
        let table = self.table.lock();
        f(&table[n as usize].ec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkt(len: u32) -> Packet {
        Packet {
            header: Box::new([0u8; BSIZE]),
            data_pages: vec![],
            data_len: len,
        }
    }

    #[test]
    fn put_then_get_round_trips_metadata() {
        let sock = Sock::new();
        sock.open(5, 1, 1024, 4).unwrap();
        sock.put(5, pkt(100), PutFlags::empty(), 7, 9).unwrap();
        assert_eq!(sock.queue_len(5), 1);
        let got = sock.get(5).unwrap();
        let meta = PacketMeta::read_from(&got.header);
        assert_eq!(meta.ec_param1, 7);
        assert_eq!(meta.ec_param2, 9);
        assert_eq!(got.data_len, 100);
        assert!(sock.get(5).is_none());
    }

    #[test]
    fn queue_full_is_rejected() {
        let sock = Sock::new();
        sock.open(6, 1, 1024, 2).unwrap();
        sock.put(6, pkt(1), PutFlags::empty(), 0, 0).unwrap();
        sock.put(6, pkt(1), PutFlags::empty(), 0, 0).unwrap();
        assert!(matches!(sock.put(6, pkt(1), PutFlags::empty(), 0, 0), Err(Status::QueueFull)));
    }

    #[test]
    fn needs_open_auto_allocates() {
        let sock = Sock::new();
        let n = sock.allocate(2, 1024, 4).unwrap();
        sock.close(n);
        assert!(!sock.is_allocated(n));
        sock.put(n, pkt(10), PutFlags::NEEDS_OPEN, 0, 0).unwrap();
        assert!(sock.is_allocated(n));
    }

    #[test]
    fn dynamic_allocation_recycles_after_close() {
        let sock = Sock::new();
        let n = sock.allocate(1, 100, 4).unwrap();
        assert!(n >= SOCK_DYNAMIC_BASE);
        sock.close(n);
        let n2 = sock.allocate(1, 100, 4).unwrap();
        assert_eq!(n, n2);
    }
}
