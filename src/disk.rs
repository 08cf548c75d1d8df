//! Volume manager (spec.md §4.4).
//!
//! Tracks up to [`DISK_SLOTS`] physical/logical volume slots and drives
//! each one through its mount-state machine, dispatching to the
//! per-device [`BlockDevice`] vtable and drawing I/O queue blocks from a
//! [`QBlkPool`]. This plays the role the teacher's `virtio_disk`
//! (removed; see `TEACHER.txt`) played for a single fixed device, widened
//! to a small fixed table the way `kernel-rs/src/proc/mod.rs`'s process
//! table is a fixed array of slots rather than a dynamic collection.

use crate::driver::{BlockDevice, QBlkPool};
use crate::lock::ExclLock;
use crate::param::DISK_SLOTS;
use crate::status::{Result, Status};
use crate::uid::Uid;
use std::sync::Arc;

/// Mount-state machine states, per spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Free,
    Reserved,
    Assigned,
    Busy,
    Mirror,
}

/// One volume-manager slot.
pub struct Slot {
    pub uid: Uid,
    /// Disk-address range start (absolute physical block).
    pub addr_start: u32,
    pub addr_len: u32,
    /// Logical-volume start offset; 0 for physical volumes.
    pub lv_start: u32,
    pub state: MountState,
    pub owner: Option<u32>,
    pub device: Option<Arc<dyn BlockDevice>>,
    pub unit: u16,
}

impl Slot {
    fn empty() -> Self {
        Self {
            uid: Uid::NIL,
            addr_start: 0,
            addr_len: 0,
            lv_start: 0,
            state: MountState::Free,
            owner: None,
            device: None,
            unit: 0,
        }
    }
}

struct Table {
    slots: Vec<Slot>,
}

/// The volume manager: up to [`DISK_SLOTS`] PV/LV slots, a queue-block
/// pool shared by every driver, and the mount-table lock
/// (spec.md §5: "DISK mount table" is an [`ExclLock`]).
pub struct Disk {
    table: ExclLock<Table>,
    pub qblks: QBlkPool,
}

impl Default for Disk {
    fn default() -> Self {
        Self::new()
    }
}

impl Disk {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(DISK_SLOTS);
        for _ in 0..DISK_SLOTS {
            slots.push(Slot::empty());
        }
        Self {
            table: ExclLock::new("disk_table", Table { slots }),
            qblks: QBlkPool::new(64),
        }
    }

    fn first_free(table: &Table) -> Option<usize> {
        table.slots.iter().position(|s| s.state == MountState::Free)
    }

    /// Claims a free slot for a physical volume and initializes its
    /// driver, transitioning `free -> reserved`.
    pub fn pv_assign(
        &self,
        uid: Uid,
        addr_start: u32,
        addr_len: u32,
        unit: u16,
        device: Arc<dyn BlockDevice>,
        owner: u32,
    ) -> Result<usize> {
        let mut table = self.table.lock();
        let idx = Self::first_free(&table).ok_or(Status::VolumeTableFull)?;
        device.init(unit)?;
        let slot = &mut table.slots[idx];
        slot.uid = uid;
        slot.addr_start = addr_start;
        slot.addr_len = addr_len;
        slot.lv_start = 0;
        slot.unit = unit;
        slot.device = Some(device);
        slot.owner = Some(owner);
        slot.state = MountState::Reserved;
        Ok(idx)
    }

    /// `reserved -> assigned`. Only the assigning owner may do this
    /// (spec.md §4.4 invariant).
    pub fn pv_mount(&self, idx: usize, caller: u32) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table.slots.get_mut(idx).ok_or(Status::InvalidBlock)?;
        if slot.state != MountState::Reserved {
            return Err(Status::VolumeInUse);
        }
        if slot.owner != Some(caller) {
            return Err(Status::VolumeInUse);
        }
        slot.state = MountState::Assigned;
        Ok(())
    }

    /// `assigned -> busy`, widening the slot to a logical volume living
    /// at `lv_start` within the underlying physical extent.
    pub fn lv_assign(&self, idx: usize, lv_start: u32, caller: u32) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table.slots.get_mut(idx).ok_or(Status::InvalidBlock)?;
        if slot.state != MountState::Assigned || slot.owner != Some(caller) {
            return Err(Status::VolumeInUse);
        }
        slot.lv_start = lv_start;
        slot.state = MountState::Busy;
        Ok(())
    }

    /// Marks a slot `busy -> mirror`, i.e. a redundant copy of another
    /// volume's data (spec.md §4.4 mount states).
    pub fn lv_mount(&self, idx: usize, caller: u32) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table.slots.get_mut(idx).ok_or(Status::InvalidBlock)?;
        if slot.state != MountState::Busy || slot.owner != Some(caller) {
            return Err(Status::VolumeInUse);
        }
        slot.state = MountState::Mirror;
        Ok(())
    }

    /// Any state `-> free`. I/O-transient driver errors are swallowed
    /// here (spec.md §7: `dismount` treats them as ok).
    pub fn dismount(&self, idx: usize) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table.slots.get_mut(idx).ok_or(Status::InvalidBlock)?;
        if let Some(dev) = &slot.device {
            if let Err(e) = dev.revalidate(slot.unit) {
                if !e.is_io_transient() {
                    return Err(e);
                }
            }
        }
        *slot = Slot::empty();
        Ok(())
    }

    pub fn unassign(&self, idx: usize, caller: u32) -> Result<()> {
        let mut table = self.table.lock();
        let slot = table.slots.get_mut(idx).ok_or(Status::InvalidBlock)?;
        if slot.owner != Some(caller) {
            return Err(Status::VolumeInUse);
        }
        *slot = Slot::empty();
        Ok(())
    }

    pub fn state(&self, idx: usize) -> Result<MountState> {
        let table = self.table.lock();
        Ok(table.slots.get(idx).ok_or(Status::InvalidBlock)?.state)
    }

    /// Dispatches one I/O to `idx`'s device, translating the logical
    /// block through `lv_start`/`addr_start`.
    pub fn io(&self, idx: usize, lv_block: u32, dir: crate::driver::IoDirection, buf: &mut [u8; crate::param::BSIZE]) -> Result<()> {
        let (device, unit, phys_block) = {
            let table = self.table.lock();
            let slot = table.slots.get(idx).ok_or(Status::InvalidBlock)?;
            if !matches!(slot.state, MountState::Busy | MountState::Mirror) {
                return Err(Status::VolumeNotMounted);
            }
            let device = slot.device.clone().ok_or(Status::VolumeNotMounted)?;
            let phys_block = slot.addr_start + slot.lv_start + lv_block;
            (device, slot.unit, phys_block)
        };
        device.io(unit, phys_block, dir, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryBlockDevice;

    #[test]
    fn mount_state_machine_transitions() {
        let disk = Disk::new();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new());
        let idx = disk.pv_assign(Uid::new(1, 1), 0, 1000, 0, dev, 42).unwrap();
        assert_eq!(disk.state(idx).unwrap(), MountState::Reserved);

        disk.pv_mount(idx, 42).unwrap();
        assert_eq!(disk.state(idx).unwrap(), MountState::Assigned);

        disk.lv_assign(idx, 0, 42).unwrap();
        assert_eq!(disk.state(idx).unwrap(), MountState::Busy);

        disk.dismount(idx).unwrap();
        assert_eq!(disk.state(idx).unwrap(), MountState::Free);
    }

    #[test]
    fn wrong_owner_is_rejected() {
        let disk = Disk::new();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new());
        let idx = disk.pv_assign(Uid::new(1, 1), 0, 1000, 0, dev, 42).unwrap();
        assert!(disk.pv_mount(idx, 99).is_err());
    }

    #[test]
    fn table_full_is_rejected() {
        let disk = Disk::new();
        for _ in 0..DISK_SLOTS {
            let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new());
            disk.pv_assign(Uid::new(1, 1), 0, 10, 0, dev, 1).unwrap();
        }
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new());
        assert!(matches!(
            disk.pv_assign(Uid::new(1, 1), 0, 10, 0, dev, 1),
            Err(Status::VolumeTableFull)
        ));
    }

    #[test]
    fn io_round_trips_through_lv_offset() {
        let disk = Disk::new();
        let dev: Arc<dyn BlockDevice> = Arc::new(MemoryBlockDevice::new());
        let idx = disk.pv_assign(Uid::new(1, 1), 100, 1000, 0, dev, 1).unwrap();
        disk.pv_mount(idx, 1).unwrap();
        disk.lv_assign(idx, 5, 1).unwrap();

        let mut buf = [42u8; crate::param::BSIZE];
        disk.io(idx, 3, crate::driver::IoDirection::Write, &mut buf).unwrap();
        let mut readback = [0u8; crate::param::BSIZE];
        disk.io(idx, 3, crate::driver::IoDirection::Read, &mut readback).unwrap();
        assert_eq!(buf, readback);
    }
}
