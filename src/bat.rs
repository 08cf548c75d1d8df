//! Block allocation table: the on-volume free-space allocator
//! (spec.md §4.3).
//!
//! Two-level bitmap allocation over a set of fixed-size partitions, plus
//! VTOCE (metadata-block) chaining. One BAT bitmap block is exactly one
//! [`BSIZE`]-byte [`crate::dbuf`] block (`BAT_BITS_PER_BLOCK` = 8 ×
//! `BSIZE`), so the allocator walks bitmap blocks through the buffer
//! cache rather than through its own I/O path — the teacher's
//! `kernel-rs/src/bio.rs` + `fs.rs` draw the same line between "the
//! buffer cache does the I/O" and "the allocator only does bit math",
//! just for an inode-based free list instead of a partitioned one. All
//! BAT state lives behind a single sleeping [`ExclLock`] per spec.md §5
//! ("a single sleeping lock (`BAT_LOCK`)"), dropped across buffer-cache
//! calls to avoid lock inversion with DBUF.

use std::collections::HashMap;

use crate::dbuf::{BufHandle, Dbuf, GetFlags, SetFlags};
use crate::lock::ExclLock;
use crate::param::{
    BAT_BITS_PER_BLOCK, BAT_WORDS_PER_BLOCK, BSIZE, MAX_PARTITIONS, OLD_FORMAT_RESERVE_BUFFER,
    VTOCE_ENTRIES_PER_BLOCK, VTOCE_MAGIC,
};
use crate::status::{Result, Status};
use crate::uid::Uid;

const SALVAGE_BIT_NEW: u16 = 1 << 12;

mod label_offset {
    pub const FORMAT_VERSION: usize = 0x00;
    pub const TOTAL_BLOCKS: usize = 0x2C;
    pub const FREE_BLOCKS: usize = 0x30;
    pub const BAT_START: usize = 0x34;
    pub const FIRST_DATA_BLOCK: usize = 0x38;
    pub const FLAGS: usize = 0x3C;
    pub const STEP_BLOCKS: usize = 0x3E;
    pub const BAT_STEP: usize = 0x40;
    pub const RESERVED_BLOCKS: usize = 0x44;
    pub const MOUNT_TIME: usize = 0xB0;
    pub const MOUNT_NODE_INFO: usize = 0xB4;
    pub const BOOT_TIME: usize = 0xB8;
    pub const DISMOUNT_TIME: usize = 0xBC;
    pub const SALVAGE_FLAG: usize = 0xCE;
    pub const PARTITION_COUNT: usize = 0xFC;
    pub const PARTITION_START_OFFSET: usize = 0xFE;
    pub const PARTITION_SIZE: usize = 0x100;
    pub const PARTITION_TABLE: usize = 0x104;
    pub const PARTITION_ENTRY_SIZE: usize = 8;
}

static_assertions::const_assert!(
    label_offset::PARTITION_TABLE + MAX_PARTITIONS * label_offset::PARTITION_ENTRY_SIZE <= BSIZE
);

mod vtoce_offset {
    pub const NEXT_VTOCE: usize = 0x000;
    pub const ENTRY_COUNT: usize = 0x004;
    pub const ENTRY_DATA: usize = 0x006;
    pub const ENTRY_DATA_LEN: usize = 0x3F2;
    pub const MAGIC: usize = 0x3F8;
    pub const SELF_BLOCK: usize = 0x3FC;
}

static_assertions::const_assert_eq!(vtoce_offset::ENTRY_DATA + vtoce_offset::ENTRY_DATA_LEN, vtoce_offset::MAGIC);
static_assertions::const_assert_eq!(vtoce_offset::MAGIC + 4 + 4, BSIZE);

fn ru16(buf: &[u8; BSIZE], off: usize) -> u16 {
    u16::from_ne_bytes([buf[off], buf[off + 1]])
}
fn wu16(buf: &mut [u8; BSIZE], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_ne_bytes());
}
fn ru32(buf: &[u8; BSIZE], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}
fn wu32(buf: &mut [u8; BSIZE], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_ne_bytes());
}
/// Reads a 3-byte little-endian field (the on-disk `vtoce_block`, which
/// shares its containing word with the 1-byte partition status at `off - 1`).
fn ru24(buf: &[u8; BSIZE], off: usize) -> u32 {
    u32::from_ne_bytes([buf[off], buf[off + 1], buf[off + 2], 0])
}
fn wu24(buf: &mut [u8; BSIZE], off: usize, v: u32) {
    let bytes = v.to_ne_bytes();
    buf[off..off + 3].copy_from_slice(&bytes[..3]);
}

/// Partition status byte, per-partition entry in the volume label.
pub const PARTITION_EMPTY: u8 = 0;
pub const PARTITION_FULL: u8 = 1;
pub const PARTITION_PARTIAL: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct Partition {
    pub free_count: u32,
    pub status: u8,
    /// Block number of the partition's VTOCE chain head (24-bit on disk;
    /// 0 means no chain yet).
    pub vtoce_block: u32,
}

/// The parsed contents of a volume's block-0 label, and the only state
/// this module persists across mount/dismount.
#[derive(Debug, Clone)]
pub struct VolumeLabel {
    pub format_version: u16,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub bat_start: u32,
    pub first_data_block: u32,
    pub flags: u16,
    pub step_blocks: u16,
    pub bat_step: u16,
    pub reserved_blocks: u32,
    pub mount_time: u32,
    pub mount_node_info: u32,
    pub boot_time: u32,
    pub dismount_time: u32,
    pub salvage_flag: u16,
    pub partition_start_offset: u16,
    pub partition_size: u32,
    pub partitions: Vec<Partition>,
}

impl VolumeLabel {
    pub fn from_bytes(buf: &[u8; BSIZE]) -> Self {
        use label_offset::*;
        let partition_count = (ru16(buf, PARTITION_COUNT) as usize).min(MAX_PARTITIONS);
        let mut partitions = Vec::with_capacity(partition_count);
        for i in 0..partition_count {
            let base = PARTITION_TABLE + i * PARTITION_ENTRY_SIZE;
            let free_count = ru32(buf, base);
            let status = buf[base + 4];
            let vtoce_block = ru24(buf, base + 5);
            partitions.push(Partition {
                free_count,
                status,
                vtoce_block,
            });
        }
        Self {
            format_version: ru16(buf, FORMAT_VERSION),
            total_blocks: ru32(buf, TOTAL_BLOCKS),
            free_blocks: ru32(buf, FREE_BLOCKS),
            bat_start: ru32(buf, BAT_START),
            first_data_block: ru32(buf, FIRST_DATA_BLOCK),
            flags: ru16(buf, FLAGS),
            step_blocks: ru16(buf, STEP_BLOCKS),
            bat_step: ru16(buf, BAT_STEP),
            reserved_blocks: ru32(buf, RESERVED_BLOCKS),
            mount_time: ru32(buf, MOUNT_TIME),
            mount_node_info: ru32(buf, MOUNT_NODE_INFO),
            boot_time: ru32(buf, BOOT_TIME),
            dismount_time: ru32(buf, DISMOUNT_TIME),
            salvage_flag: ru16(buf, SALVAGE_FLAG),
            partition_start_offset: ru16(buf, PARTITION_START_OFFSET),
            partition_size: ru32(buf, PARTITION_SIZE),
            partitions,
        }
    }

    pub fn to_bytes(&self) -> [u8; BSIZE] {
        use label_offset::*;
        let mut buf = [0u8; BSIZE];
        wu16(&mut buf, FORMAT_VERSION, self.format_version);
        wu32(&mut buf, TOTAL_BLOCKS, self.total_blocks);
        wu32(&mut buf, FREE_BLOCKS, self.free_blocks);
        wu32(&mut buf, BAT_START, self.bat_start);
        wu32(&mut buf, FIRST_DATA_BLOCK, self.first_data_block);
        wu16(&mut buf, FLAGS, self.flags);
        wu16(&mut buf, STEP_BLOCKS, self.step_blocks);
        wu16(&mut buf, BAT_STEP, self.bat_step);
        wu32(&mut buf, RESERVED_BLOCKS, self.reserved_blocks);
        wu32(&mut buf, MOUNT_TIME, self.mount_time);
        wu32(&mut buf, MOUNT_NODE_INFO, self.mount_node_info);
        wu32(&mut buf, BOOT_TIME, self.boot_time);
        wu32(&mut buf, DISMOUNT_TIME, self.dismount_time);
        wu16(&mut buf, SALVAGE_FLAG, self.salvage_flag);
        wu16(&mut buf, PARTITION_COUNT, self.partitions.len() as u16);
        wu16(&mut buf, PARTITION_START_OFFSET, self.partition_start_offset);
        wu32(&mut buf, PARTITION_SIZE, self.partition_size);
        for (i, p) in self.partitions.iter().enumerate() {
            let base = PARTITION_TABLE + i * PARTITION_ENTRY_SIZE;
            wu32(&mut buf, base, p.free_count);
            buf[base + 4] = p.status;
            wu24(&mut buf, base + 5, p.vtoce_block);
        }
        buf
    }

    fn is_old_format(&self) -> bool {
        self.format_version == 0
    }

    fn partition_abs_range(&self, idx: usize) -> (u32, u32) {
        let start =
            self.first_data_block + self.partition_start_offset as u32 + idx as u32 * self.partition_size;
        (start, start + self.partition_size)
    }

    fn partition_for_block(&self, block: u32) -> Option<usize> {
        (0..self.partitions.len()).find(|&i| {
            let (start, end) = self.partition_abs_range(i);
            block >= start && block < end
        })
    }
}

struct MountedVolume {
    label: VolumeLabel,
    stride_cursor: u32,
}

/// The block allocation table allocator. One instance guards every
/// mounted volume's metadata behind a single exclusion lock, per
/// spec.md §4.3/§5.
pub struct Bat {
    mounted: ExclLock<HashMap<u32, MountedVolume>>,
}

impl Default for Bat {
    fn default() -> Self {
        Self::new()
    }
}

impl Bat {
    pub fn new() -> Self {
        Self {
            mounted: ExclLock::new("bat", HashMap::new()),
        }
    }

    /// Reads and validates a volume's label, applying mount policy.
    /// `allow_salvage` corresponds to the caller passing "salvage ok".
    pub fn mount(&self, dbuf: &Dbuf, vol: u32, node_id: u32, now: u32, allow_salvage: bool) -> Result<()> {
        let buf = dbuf.get_block(vol, 0, Uid::NIL, GetFlags::empty())?;
        let mut label = VolumeLabel::from_bytes(&dbuf.data(&buf));

        let salvage_set = if label.is_old_format() {
            label.salvage_flag & 0x8000 != 0
        } else {
            label.flags & SALVAGE_BIT_NEW != 0
        };
        if salvage_set && !allow_salvage {
            dbuf.set_buff(&buf, SetFlags::RELEASE)?;
            return Err(Status::NeedsSalvaging);
        }

        // Stamp the salvage flag set before clearing it, so a crash
        // mid-mount still leaves the volume marked for salvage.
        self.set_salvage_flag(&mut label, true);
        self.writeback_label(dbuf, &buf, &label);
        self.set_salvage_flag(&mut label, false);

        label.mount_time = now;
        label.mount_node_info = node_id & 0x000F_FFFF;
        if label.boot_time == 0 {
            label.boot_time = now;
        }
        self.writeback_label(dbuf, &buf, &label);

        dbuf.set_buff(&buf, SetFlags::RELEASE)?;

        self.mounted.lock().insert(
            vol,
            MountedVolume {
                label,
                stride_cursor: 0,
            },
        );
        Ok(())
    }

    fn set_salvage_flag(&self, label: &mut VolumeLabel, set: bool) {
        if label.is_old_format() {
            label.salvage_flag = if set { label.salvage_flag | 0x8000 } else { label.salvage_flag & !0x8000 };
        } else {
            label.flags = if set { label.flags | SALVAGE_BIT_NEW } else { label.flags & !SALVAGE_BIT_NEW };
        }
    }

    /// Writes the label back, ignoring write-protected/storage-stopped
    /// errors per spec.md §4.3 ("read-only mounts proceed").
    fn writeback_label(&self, dbuf: &Dbuf, buf: &BufHandle, label: &VolumeLabel) {
        dbuf.write_data(buf, &label.to_bytes());
        let _ = dbuf.set_buff(buf, SetFlags::DIRTY | SetFlags::WRITEBACK);
    }

    pub fn dismount(&self, vol: u32) {
        self.mounted.lock().remove(&vol);
    }

    fn bit_index_in_partition(&self, label: &VolumeLabel, part: usize, block: u32) -> u32 {
        let (start, _) = label.partition_abs_range(part);
        block - start
    }

    /// Allocates `count` blocks, preferring to start searching near
    /// `hint` (spec.md §4.3). Returns the allocated block numbers.
    pub fn allocate(&self, dbuf: &Dbuf, vol: u32, hint: u32, count: usize, use_reserved: bool) -> Result<Vec<u32>> {
        let (start_partition, n_partitions, bat_start, first_data_block, partition_start_offset, partition_size) = {
            let guard = self.mounted.lock();
            let mv = guard.get(&vol).ok_or(Status::VolumeNotMounted)?;
            let available = mv.label.free_blocks
                - if use_reserved { 0 } else { mv.label.reserved_blocks.min(mv.label.free_blocks) };
            if (available as usize) < count {
                return Err(Status::DiskFull);
            }
            let n_partitions = mv.label.partitions.len();
            if n_partitions == 0 {
                return Err(Status::InvalidBlock);
            }
            (
                mv.label.partition_for_block(hint.max(mv.label.first_data_block)).unwrap_or(0),
                n_partitions,
                mv.label.bat_start,
                mv.label.first_data_block,
                mv.label.partition_start_offset as u32,
                mv.label.partition_size,
            )
        };

        let mut result = Vec::with_capacity(count);
        'partitions: for step in 0..n_partitions {
            let part = (start_partition + step) % n_partitions;
            let free_count = self
                .mounted
                .lock()
                .get(&vol)
                .ok_or(Status::VolumeNotMounted)?
                .label
                .partitions[part]
                .free_count;
            if free_count == 0 {
                continue;
            }

            let part_start = first_data_block + partition_start_offset + part as u32 * partition_size;
            let n_bitmap_blocks = (partition_size + BAT_BITS_PER_BLOCK - 1) / BAT_BITS_PER_BLOCK;

            for bb in 0..n_bitmap_blocks {
                if result.len() == count {
                    break 'partitions;
                }
                let bat_block = bat_start + (part_start - first_data_block) / BAT_BITS_PER_BLOCK + bb;
                let handle = dbuf.get_block(vol, bat_block, Uid::NIL, GetFlags::empty())?;
                let mut words = dbuf.data(&handle);
                let mut cleared = 0u32;
                for w in 0..BAT_WORDS_PER_BLOCK as usize {
                    if result.len() == count {
                        break;
                    }
                    let word_off = w * 4;
                    let mut word = ru32(&words, word_off);
                    if word == 0 {
                        continue;
                    }
                    for bit in 0..32u32 {
                        if result.len() == count {
                            break;
                        }
                        if word & (1 << bit) == 0 {
                            continue;
                        }
                        let local_bit = bb * BAT_BITS_PER_BLOCK + (w as u32) * 32 + bit;
                        if local_bit >= partition_size {
                            continue;
                        }
                        word &= !(1 << bit);
                        cleared += 1;
                        result.push(part_start + local_bit);
                    }
                    wu32(&mut words, word_off, word);
                }
                if cleared > 0 {
                    dbuf.write_data(&handle, &words);
                    dbuf.set_buff(&handle, SetFlags::DIRTY | SetFlags::WRITEBACK | SetFlags::RELEASE)?;
                    let mut guard = self.mounted.lock();
                    let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
                    mv.label.partitions[part].free_count = mv.label.partitions[part].free_count.saturating_sub(cleared);
                } else {
                    dbuf.set_buff(&handle, SetFlags::RELEASE)?;
                }
            }
        }

        if result.len() < count {
            // Shouldn't happen given the `available` check above unless
            // free_count bookkeeping has drifted; surface rather than panic.
            return Err(Status::DiskFull);
        }

        let mut guard = self.mounted.lock();
        let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
        mv.label.free_blocks -= count as u32;
        mv.stride_cursor = mv.stride_cursor.wrapping_add(mv.label.bat_step.max(1) as u32);
        Ok(result)
    }

    /// Frees `blocks`. A block value of `0` with `reserved == false` is
    /// the special "return one block to the free pool from reserved"
    /// marker (spec.md §4.3), not a real block number.
    pub fn free(&self, dbuf: &Dbuf, vol: u32, blocks: &[u32], reserved: bool) -> Result<()> {
        let mut guard = self.mounted.lock();
        for &block in blocks {
            if block == 0 && !reserved {
                let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
                mv.label.reserved_blocks = mv.label.reserved_blocks.saturating_sub(1);
                mv.label.free_blocks += 1;
                continue;
            }

            let mv = guard.get(&vol).ok_or(Status::VolumeNotMounted)?;
            let part = mv.label.partition_for_block(block).ok_or(Status::InvalidBlock)?;
            let local_bit = self.bit_index_in_partition(&mv.label, part, block);
            let bat_block = mv.label.bat_start + local_bit / BAT_BITS_PER_BLOCK;
            let word_idx = (local_bit % BAT_BITS_PER_BLOCK) / 32;
            let bit_idx = local_bit % 32;

            drop(guard);
            let handle = dbuf.get_block(vol, bat_block, Uid::NIL, GetFlags::empty())?;
            let mut words = dbuf.data(&handle);
            let word_off = word_idx as usize * 4;
            let mut word = ru32(&words, word_off);
            if word & (1 << bit_idx) != 0 {
                dbuf.set_buff(&handle, SetFlags::RELEASE)?;
                return Err(Status::InvalidBlock); // double free
            }
            word |= 1 << bit_idx;
            wu32(&mut words, word_off, word);
            dbuf.write_data(&handle, &words);
            dbuf.set_buff(&handle, SetFlags::DIRTY | SetFlags::WRITEBACK | SetFlags::RELEASE)?;

            guard = self.mounted.lock();
            let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
            mv.label.partitions[part].free_count += 1;
            if reserved {
                mv.label.reserved_blocks += 1;
            } else {
                mv.label.free_blocks += 1;
            }
        }
        Ok(())
    }

    /// Allocates (or returns the current chain head for) a VTOCE block in
    /// whichever partition spec.md §4.3 says is the best fit. Returns
    /// `(block, true)` when a fresh block was allocated and initialized.
    pub fn alloc_vtoce(&self, dbuf: &Dbuf, vol: u32, hint: u32) -> Result<(u32, bool)> {
        let guard = self.mounted.lock();
        let mv = guard.get(&vol).ok_or(Status::VolumeNotMounted)?;
        let n = mv.label.partitions.len();
        if n == 0 {
            return Err(Status::InvalidBlock);
        }
        let threshold = mv.label.partition_size / 8;
        let mut chosen = (0..n).find(|&i| {
            mv.label.partitions[i].status == PARTITION_PARTIAL && mv.label.partitions[i].free_count > threshold
        });
        if chosen.is_none() {
            chosen = (0..n).max_by_key(|&i| mv.label.partitions[i].free_count);
        }
        let part = chosen.ok_or(Status::InvalidBlock)?;
        let existing = mv.label.partitions[part].vtoce_block;
        drop(guard);

        if existing != 0 {
            let handle = dbuf.get_block(vol, existing, Uid::NIL, GetFlags::empty())?;
            let mut bytes = dbuf.data(&handle);
            let mut entry_count = ru16(&bytes, vtoce_offset::ENTRY_COUNT);
            entry_count += 1;
            wu16(&mut bytes, vtoce_offset::ENTRY_COUNT, entry_count);
            let next_vtoce = ru32(&bytes, vtoce_offset::NEXT_VTOCE);
            dbuf.write_data(&handle, &bytes);
            dbuf.set_buff(&handle, SetFlags::DIRTY | SetFlags::WRITEBACK | SetFlags::RELEASE)?;

            let mut guard = self.mounted.lock();
            let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
            if entry_count as u8 >= VTOCE_ENTRIES_PER_BLOCK {
                mv.label.partitions[part].vtoce_block = next_vtoce;
                if next_vtoce == 0 {
                    mv.label.partitions[part].status = PARTITION_EMPTY;
                }
            }
            return Ok((existing, false));
        }

        let blocks = self.allocate(dbuf, vol, hint, 1, true)?;
        let block = blocks[0];
        let handle = dbuf.get_block(vol, block, Uid::NIL, GetFlags::empty())?;
        let mut bytes = [0u8; BSIZE];
        wu32(&mut bytes, vtoce_offset::NEXT_VTOCE, 0);
        wu16(&mut bytes, vtoce_offset::ENTRY_COUNT, 1);
        wu32(&mut bytes, vtoce_offset::MAGIC, VTOCE_MAGIC);
        wu32(&mut bytes, vtoce_offset::SELF_BLOCK, block);
        dbuf.write_data(&handle, &bytes);
        dbuf.set_buff(&handle, SetFlags::DIRTY | SetFlags::WRITEBACK | SetFlags::RELEASE)?;

        let mut guard = self.mounted.lock();
        let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
        mv.label.partitions[part].vtoce_block = block;
        mv.label.partitions[part].status = PARTITION_PARTIAL;
        Ok((block, true))
    }

    /// Moves `n` blocks from free to reserved, enforcing the old-format
    /// reserve buffer (spec.md §4.3, §9 Open Behavioral Questions).
    pub fn reserve(&self, vol: u32, n: u32) -> Result<()> {
        let mut guard = self.mounted.lock();
        let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
        let floor = if mv.label.is_old_format() { OLD_FORMAT_RESERVE_BUFFER } else { 0 };
        if mv.label.free_blocks < n + floor {
            return Err(Status::DiskFull);
        }
        mv.label.free_blocks -= n;
        mv.label.reserved_blocks += n;
        Ok(())
    }

    /// Inverse of [`Bat::reserve`].
    pub fn cancel(&self, vol: u32, n: u32) -> Result<()> {
        let mut guard = self.mounted.lock();
        let mv = guard.get_mut(&vol).ok_or(Status::VolumeNotMounted)?;
        if mv.label.reserved_blocks < n {
            return Err(Status::DiskFull);
        }
        mv.label.reserved_blocks -= n;
        mv.label.free_blocks += n;
        Ok(())
    }

    /// Snapshot of a mounted volume's free/reserved/partition counters,
    /// for tests and higher-level status queries.
    pub fn stats(&self, vol: u32) -> Result<(u32, u32, Vec<u32>)> {
        let guard = self.mounted.lock();
        let mv = guard.get(&vol).ok_or(Status::VolumeNotMounted)?;
        Ok((
            mv.label.free_blocks,
            mv.label.reserved_blocks,
            mv.label.partitions.iter().map(|p| p.free_count).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryBlockDevice;
    use std::sync::Arc;

    /// Writes a fresh label directly to the memory device (bypassing
    /// `mount`'s own read/modify cycle), matching scenario 1 in spec.md §8:
    /// a 100-block volume, one partition, nothing allocated yet.
    fn format_volume(dev: &MemoryBlockDevice, vol: u16, total_blocks: u32, first_data_block: u32) {
        let mut label = VolumeLabel {
            format_version: 1,
            total_blocks,
            free_blocks: total_blocks - first_data_block,
            bat_start: 1,
            first_data_block,
            flags: 0,
            step_blocks: 1,
            bat_step: 1,
            reserved_blocks: 0,
            mount_time: 0,
            mount_node_info: 0,
            boot_time: 0,
            dismount_time: 0,
            salvage_flag: 0,
            partition_start_offset: 0,
            partition_size: total_blocks - first_data_block,
            partitions: vec![Partition {
                free_count: total_blocks - first_data_block,
                status: PARTITION_EMPTY,
                vtoce_block: 0,
            }],
        };
        let mut buf = [0u8; BSIZE];
        buf.copy_from_slice(&label.to_bytes());
        dev.io(vol, 0, crate::driver::IoDirection::Write, &mut buf).unwrap();

        // Initialize the BAT bitmap block(s) to all-ones (all free).
        let n_bitmap_blocks =
            (label.partition_size + BAT_BITS_PER_BLOCK - 1) / BAT_BITS_PER_BLOCK;
        for bb in 0..n_bitmap_blocks {
            let mut words = [0xFFu8; BSIZE];
            dev.io(vol, label.bat_start + bb, crate::driver::IoDirection::Write, &mut words).unwrap();
        }
        let _ = &mut label;
    }

    #[test]
    fn partition_entry_round_trips_status_and_vtoce_block() {
        let label = VolumeLabel {
            format_version: 1,
            total_blocks: 100,
            free_blocks: 100,
            bat_start: 1,
            first_data_block: 0,
            flags: 0,
            step_blocks: 1,
            bat_step: 1,
            reserved_blocks: 0,
            mount_time: 0,
            mount_node_info: 0,
            boot_time: 0,
            dismount_time: 0,
            salvage_flag: 0,
            partition_start_offset: 0,
            partition_size: 100,
            partitions: vec![Partition {
                free_count: 42,
                status: PARTITION_PARTIAL,
                vtoce_block: 0x00AB_CDEF,
            }],
        };
        let buf = label.to_bytes();
        let back = VolumeLabel::from_bytes(&buf);
        assert_eq!(back.partitions[0].status, PARTITION_PARTIAL);
        assert_eq!(back.partitions[0].vtoce_block, 0x00AB_CDEF);
        assert_eq!(back.partitions[0].free_count, 42);
    }

    #[test]
    fn mount_alloc_free_cycle() {
        let dev = Arc::new(MemoryBlockDevice::new());
        format_volume(&dev, 1, 100, 0);
        let dbuf = Dbuf::new(64 * crate::param::DBUF_DIVISOR, dev);
        let bat = Bat::new();
        bat.mount(&dbuf, 1, 7, 1000, false).unwrap();

        let (free, _reserved, _parts) = bat.stats(1).unwrap();
        assert_eq!(free, 100);

        let blocks = bat.allocate(&dbuf, 1, 0, 10, false).unwrap();
        assert_eq!(blocks, (0..10).collect::<Vec<_>>());
        let (free, _reserved, parts) = bat.stats(1).unwrap();
        assert_eq!(free, 90);
        assert_eq!(parts[0], 90);

        bat.free(&dbuf, 1, &blocks, false).unwrap();
        let (free, _reserved, parts) = bat.stats(1).unwrap();
        assert_eq!(free, 100);
        assert_eq!(parts[0], 100);
    }

    #[test]
    fn vtoce_chain_advances_after_three_entries() {
        let dev = Arc::new(MemoryBlockDevice::new());
        format_volume(&dev, 2, 100, 0);
        let dbuf = Dbuf::new(64 * crate::param::DBUF_DIVISOR, dev);
        let bat = Bat::new();
        bat.mount(&dbuf, 2, 7, 1000, false).unwrap();

        let (b1, new1) = bat.alloc_vtoce(&dbuf, 2, 0).unwrap();
        assert!(new1);
        let (b2, new2) = bat.alloc_vtoce(&dbuf, 2, 0).unwrap();
        assert_eq!(b2, b1);
        assert!(!new2);
        let (b3, new3) = bat.alloc_vtoce(&dbuf, 2, 0).unwrap();
        assert_eq!(b3, b1);
        assert!(!new3);

        // Fourth call: entry_count hit 3 on the third call, head advanced
        // to next_vtoce (0), so this allocates a fresh block.
        let (b4, new4) = bat.alloc_vtoce(&dbuf, 2, 0).unwrap();
        assert!(new4);
        assert_ne!(b4, b1);
    }

    #[test]
    fn reserve_then_cancel_restores_counters() {
        let dev = Arc::new(MemoryBlockDevice::new());
        format_volume(&dev, 3, 200, 0);
        let dbuf = Dbuf::new(64 * crate::param::DBUF_DIVISOR, dev);
        let bat = Bat::new();
        bat.mount(&dbuf, 3, 7, 1000, false).unwrap();

        bat.reserve(3, 20).unwrap();
        let (free, reserved, _) = bat.stats(3).unwrap();
        assert_eq!(free, 180);
        assert_eq!(reserved, 20);

        bat.cancel(3, 20).unwrap();
        let (free, reserved, _) = bat.stats(3).unwrap();
        assert_eq!(free, 200);
        assert_eq!(reserved, 0);
    }

    #[test]
    fn double_free_is_rejected() {
        let dev = Arc::new(MemoryBlockDevice::new());
        format_volume(&dev, 4, 50, 0);
        let dbuf = Dbuf::new(64 * crate::param::DBUF_DIVISOR, dev);
        let bat = Bat::new();
        bat.mount(&dbuf, 4, 7, 1000, false).unwrap();
        let blocks = bat.allocate(&dbuf, 4, 0, 1, false).unwrap();
        bat.free(&dbuf, 4, &blocks, false).unwrap();
        assert!(bat.free(&dbuf, 4, &blocks, false).is_err());
    }
}
