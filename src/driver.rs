//! Device driver dispatch.
//!
//! spec.md §1 lists device-specific drivers as external collaborators,
//! "consumed through a vtable of `init/io/revalid/error` functions"; §4.4
//! says DISK dispatches to that vtable and draws I/O queue blocks from a
//! private pool allocator. [`BlockDevice`] is the vtable as a trait
//! object (the hosted equivalent of the teacher's driver traits, e.g.
//! `kernel-rs`'s now-removed `virtio_disk` backend, which this crate
//! replaces with an injectable trait since there is no real disk
//! controller on a hosted target), and [`QBlkPool`] is the queue-block
//! allocator DISK hands out to drivers.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::param::BSIZE;
use crate::status::{Result, Status};

/// One physical I/O operation a driver must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// The vtable spec.md §4.4 says every device is dispatched through.
pub trait BlockDevice: Send + Sync {
    /// One-time driver/unit initialization.
    fn init(&self, unit: u16) -> Result<()>;

    /// Performs a single 1 KiB block transfer.
    fn io(&self, unit: u16, block: u32, dir: IoDirection, buf: &mut [u8; BSIZE]) -> Result<()>;

    /// Re-validates media (e.g. after a removable-media change).
    fn revalidate(&self, unit: u16) -> Result<()>;

    /// Drains the driver's error queue, returning the oldest pending error
    /// if any (drivers report asynchronous failures this way rather than
    /// through `io`'s return value, per the original `error_que.c` split).
    fn poll_error(&self, unit: u16) -> Option<Status>;
}

/// An in-memory stand-in for a physical disk, used by tests and by any
/// caller that wants a working volume without real hardware. Block 0 of
/// each unit starts zeroed; reads of never-written blocks return zeros.
#[derive(Debug, Default)]
pub struct MemoryBlockDevice {
    units: Mutex<std::collections::HashMap<(u16, u32), [u8; BSIZE]>>,
}

impl MemoryBlockDevice {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn init(&self, _unit: u16) -> Result<()> {
        Ok(())
    }

    fn io(&self, unit: u16, block: u32, dir: IoDirection, buf: &mut [u8; BSIZE]) -> Result<()> {
        let mut units = self.units.lock().unwrap();
        match dir {
            IoDirection::Read => {
                if let Some(data) = units.get(&(unit, block)) {
                    buf.copy_from_slice(data);
                } else {
                    buf.fill(0);
                }
            }
            IoDirection::Write => {
                units.insert((unit, block), *buf);
            }
        }
        Ok(())
    }

    fn revalidate(&self, _unit: u16) -> Result<()> {
        Ok(())
    }

    fn poll_error(&self, _unit: u16) -> Option<Status> {
        None
    }
}

/// One outstanding-I/O queue block. Drivers chain these to submit
/// requests; DISK draws them from [`QBlkPool`] rather than allocating
/// fresh memory on every request (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct QBlk {
    pub unit: u16,
    pub block: u32,
    pub dir: IoDirection,
}

/// A private free-list pool of [`QBlk`]s, analogous to the teacher's
/// fixed-capacity pools (`kernel-rs/src/pool.rs`).
#[derive(Debug)]
pub struct QBlkPool {
    free: Mutex<VecDeque<QBlk>>,
    capacity: usize,
}

impl QBlkPool {
    pub fn new(capacity: usize) -> Self {
        let mut free = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            free.push_back(QBlk {
                unit: 0,
                block: 0,
                dir: IoDirection::Read,
            });
        }
        Self {
            free: Mutex::new(free),
            capacity,
        }
    }

    /// Draws `count` queue blocks from the pool, or `None` if the pool
    /// does not have that many free.
    pub fn alloc_qblks(&self, count: usize) -> Option<Vec<QBlk>> {
        let mut free = self.free.lock().unwrap();
        if free.len() < count {
            return None;
        }
        Some((0..count).filter_map(|_| free.pop_front()).collect())
    }

    /// Returns queue blocks to the pool.
    pub fn return_qblks(&self, qblks: Vec<QBlk>) {
        let mut free = self.free.lock().unwrap();
        for qblk in qblks {
            if free.len() < self.capacity {
                free.push_back(qblk);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_device_round_trips() {
        let dev = MemoryBlockDevice::new();
        let mut buf = [7u8; BSIZE];
        dev.io(0, 3, IoDirection::Write, &mut buf).unwrap();
        let mut readback = [0u8; BSIZE];
        dev.io(0, 3, IoDirection::Read, &mut readback).unwrap();
        assert_eq!(buf, readback);
    }

    #[test]
    fn unwritten_block_reads_zero() {
        let dev = MemoryBlockDevice::new();
        let mut buf = [9u8; BSIZE];
        dev.io(0, 99, IoDirection::Read, &mut buf).unwrap();
        assert_eq!(buf, [0u8; BSIZE]);
    }

    #[test]
    fn qblk_pool_alloc_and_return() {
        let pool = QBlkPool::new(4);
        let qblks = pool.alloc_qblks(4).unwrap();
        assert!(pool.alloc_qblks(1).is_none());
        pool.return_qblks(qblks);
        assert!(pool.alloc_qblks(4).is_some());
    }
}
