//! Disk buffer cache (spec.md §4.2).
//!
//! A fixed pool of `N` buffer entries in a doubly linked LRU list, MRU at
//! head, searched linearly because `N` is deliberately small
//! (spec.md §4.2). This is the same shape as the teacher's buffer cache
//! (`kernel-rs/src/bio.rs`'s `Bcache = MruArena<BufEntry, NBUF>`,
//! `kernel-rs/src/arena/mru_arena.rs`), but where the teacher gets O(1)
//! splice via raw pointers and a branded-lifetime soundness proof, we
//! follow spec.md §9's own recommendation instead: one `Vec` of entries
//! plus `u32` next/prev *indices* with a sentinel, behind one
//! [`SpinLock`] — an arena-plus-index design that needs no unsafe code to
//! be sound.

use std::sync::Mutex;

use crate::clock::Clock;
use crate::driver::{BlockDevice, IoDirection};
use crate::lock::{EventCount, SpinLock};
use crate::param::{BSIZE, DBUF_DIVISOR, DBUF_MAX, DBUF_MIN};
use crate::status::{Result, Status};
use crate::uid::Uid;

/// Sentinel index meaning "no entry" / "no such block".
pub const NONE: u32 = u32::MAX;

bitflags::bitflags! {
    /// Flags accepted by [`Dbuf::get_block`].
    pub struct GetFlags: u8 {
        /// Swallow `storage_module_stopped`/`disk_write_protected` on the
        /// read path instead of returning it (spec.md §4.2, §7).
        const ALLOW_STOPPED_STORAGE = 0b01;
        /// Refresh the entry's `expected_uid`/hint on a cache hit.
        const REFRESH_UID = 0b10;
    }
}

bitflags::bitflags! {
    /// Flags accepted by [`Dbuf::set_buff`].
    pub struct SetFlags: u8 {
        const DIRTY      = 0b0001;
        const WRITEBACK  = 0b0010;
        const INVALIDATE = 0b0100;
        const RELEASE    = 0b1000;
    }
}

#[derive(Debug, Clone)]
struct BufEntry {
    vol: u32,
    block: u32,
    expected_uid: Uid,
    busy: bool,
    dirty: bool,
    valid: bool,
    refcount: u32,
    data: [u8; BSIZE],
    prev: u32,
    next: u32,
}

impl BufEntry {
    fn empty() -> Self {
        Self {
            vol: NONE,
            block: NONE,
            expected_uid: Uid::NIL,
            busy: false,
            dirty: false,
            valid: false,
            refcount: 0,
            data: [0u8; BSIZE],
            prev: NONE,
            next: NONE,
        }
    }
}

struct Inner {
    entries: Vec<BufEntry>,
    head: u32, // MRU
    tail: u32, // LRU
}

impl Inner {
    fn unlink(&mut self, idx: u32) {
        let (prev, next) = (self.entries[idx as usize].prev, self.entries[idx as usize].next);
        if prev != NONE {
            self.entries[prev as usize].next = next;
        } else {
            self.head = next;
        }
        if next != NONE {
            self.entries[next as usize].prev = prev;
        } else {
            self.tail = prev;
        }
        self.entries[idx as usize].prev = NONE;
        self.entries[idx as usize].next = NONE;
    }

    fn push_head(&mut self, idx: u32) {
        self.entries[idx as usize].prev = NONE;
        self.entries[idx as usize].next = self.head;
        if self.head != NONE {
            self.entries[self.head as usize].prev = idx;
        }
        self.head = idx;
        if self.tail == NONE {
            self.tail = idx;
        }
    }

    fn splice_to_head(&mut self, idx: u32) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_head(idx);
    }

    /// Matches both resident entries and entries mid-fill (`busy` but not
    /// yet `valid`), so a second thread racing a first miss on the same
    /// block waits on that fill instead of starting a redundant one.
    fn find(&self, vol: u32, block: u32) -> Option<u32> {
        self.entries
            .iter()
            .position(|e| (e.valid || e.busy) && e.vol == vol && e.block == block)
            .map(|i| i as u32)
    }

    /// Scans from the LRU tail for the first non-busy, unreferenced entry.
    fn find_victim(&self) -> Option<u32> {
        let mut cur = self.tail;
        while cur != NONE {
            let e = &self.entries[cur as usize];
            if !e.busy && e.refcount == 0 {
                return Some(cur);
            }
            cur = e.prev;
        }
        None
    }
}

/// A handle to a locked buffer, analogous to the teacher's `Buf`
/// (`kernel-rs/src/bio.rs`). Obtained from [`Dbuf::get_block`].
#[derive(Debug)]
pub struct BufHandle {
    idx: u32,
    pub vol: u32,
    pub block: u32,
}

/// The disk buffer cache.
pub struct Dbuf {
    inner: SpinLock<Inner>,
    /// Advanced whenever a buffer becomes available (a busy entry frees,
    /// or a refcount drops to zero), so waiters in `get_block` retry.
    cache_ec: EventCount,
    trouble: Mutex<std::collections::HashSet<u32>>,
    device: std::sync::Arc<dyn BlockDevice>,
}

impl Dbuf {
    /// `N = clamp(real_pages / 64, 6..64)` per spec.md §4.2.
    pub fn cache_size(real_pages: usize) -> usize {
        (real_pages / DBUF_DIVISOR).clamp(DBUF_MIN, DBUF_MAX)
    }

    pub fn new(real_pages: usize, device: std::sync::Arc<dyn BlockDevice>) -> Self {
        let n = Self::cache_size(real_pages);
        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let mut e = BufEntry::empty();
            e.prev = if i == 0 { NONE } else { (i - 1) as u32 };
            e.next = if i + 1 == n { NONE } else { (i + 1) as u32 };
            entries.push(e);
        }
        let head = 0;
        let tail = if n == 0 { NONE } else { (n - 1) as u32 };
        Self {
            inner: SpinLock::new("dbuf", Inner { entries, head, tail }),
            cache_ec: EventCount::new(),
            trouble: Mutex::new(std::collections::HashSet::new()),
            device,
        }
    }

    fn mark_trouble(&self, vol: u32) {
        self.trouble.lock().unwrap().insert(vol);
    }

    /// Whether `vol` has pending unreplicated write damage.
    pub fn troubled(&self, vol: u32) -> bool {
        self.trouble.lock().unwrap().contains(&vol)
    }

    /// Returns the cached buffer for `(vol, block)`, reading it from disk
    /// on a miss and evicting (writing back if dirty) the LRU victim if
    /// the cache is full. See spec.md §4.2 for the full state machine.
    pub fn get_block(
        &self,
        vol: u32,
        block: u32,
        expected_uid: Uid,
        flags: GetFlags,
    ) -> Result<BufHandle> {
        loop {
            let mut guard = self.inner.lock();
            if let Some(idx) = guard.find(vol, block) {
                if guard.entries[idx as usize].busy {
                    let target = self.cache_ec.read() + 1;
                    drop(guard);
                    self.cache_ec.wait(target);
                    continue;
                }
                guard.entries[idx as usize].refcount += 1;
                if flags.contains(GetFlags::REFRESH_UID) {
                    guard.entries[idx as usize].expected_uid = expected_uid;
                }
                guard.splice_to_head(idx);
                return Ok(BufHandle { idx, vol, block });
            }

            let Some(victim) = guard.find_victim() else {
                let target = self.cache_ec.read() + 1;
                drop(guard);
                self.cache_ec.wait(target);
                continue;
            };

            if guard.entries[victim as usize].valid && guard.entries[victim as usize].dirty {
                guard.entries[victim as usize].busy = true;
                let old_vol = guard.entries[victim as usize].vol;
                let old_block = guard.entries[victim as usize].block;
                let mut data = guard.entries[victim as usize].data;
                drop(guard);

                if self.device.io(old_vol as u16, old_block, IoDirection::Write, &mut data).is_err() {
                    self.mark_trouble(old_vol);
                }

                let mut guard = self.inner.lock();
                guard.entries[victim as usize].dirty = false;
                guard.entries[victim as usize].busy = false;
                drop(guard);
                self.cache_ec.advance();
                continue;
            }

            guard.entries[victim as usize].vol = vol;
            guard.entries[victim as usize].block = block;
            guard.entries[victim as usize].expected_uid = expected_uid;
            guard.entries[victim as usize].busy = true;
            drop(guard);

            let mut data = [0u8; BSIZE];
            let io_result = self.device.io(vol as u16, block, IoDirection::Read, &mut data);

            let mut guard = self.inner.lock();
            match io_result {
                Ok(()) => {
                    guard.entries[victim as usize].data = data;
                    guard.entries[victim as usize].valid = true;
                    guard.entries[victim as usize].busy = false;
                    guard.entries[victim as usize].refcount = 1;
                    guard.splice_to_head(victim);
                    drop(guard);
                    self.cache_ec.advance();
                    return Ok(BufHandle { idx: victim, vol, block });
                }
                Err(e) if flags.contains(GetFlags::ALLOW_STOPPED_STORAGE) && e.is_io_transient() => {
                    guard.entries[victim as usize].data = [0u8; BSIZE];
                    guard.entries[victim as usize].valid = true;
                    guard.entries[victim as usize].busy = false;
                    guard.entries[victim as usize].refcount = 1;
                    guard.splice_to_head(victim);
                    drop(guard);
                    self.cache_ec.advance();
                    return Ok(BufHandle { idx: victim, vol, block });
                }
                Err(e) => {
                    guard.entries[victim as usize].valid = false;
                    guard.entries[victim as usize].busy = false;
                    guard.entries[victim as usize].vol = NONE;
                    guard.entries[victim as usize].block = NONE;
                    drop(guard);
                    self.cache_ec.advance();
                    return Err(e);
                }
            }
        }
    }

    pub fn data(&self, buf: &BufHandle) -> [u8; BSIZE] {
        self.inner.lock().entries[buf.idx as usize].data
    }

    pub fn write_data(&self, buf: &BufHandle, data: &[u8; BSIZE]) {
        self.inner.lock().entries[buf.idx as usize].data = *data;
    }

    /// Applies `flags` to `buf`. See spec.md §4.2 for per-flag semantics.
    pub fn set_buff(&self, buf: &BufHandle, flags: SetFlags) -> Result<()> {
        if flags.contains(SetFlags::DIRTY) {
            self.inner.lock().entries[buf.idx as usize].dirty = true;
        }

        if flags.contains(SetFlags::WRITEBACK) {
            let mut guard = self.inner.lock();
            let e = &mut guard.entries[buf.idx as usize];
            if e.valid {
                let mut data = e.data;
                e.dirty = false; // cleared before I/O: a concurrent writer may redirty.
                let vol = e.vol;
                let block = e.block;
                drop(guard);
                if self.device.io(vol as u16, block, IoDirection::Write, &mut data).is_err() {
                    self.mark_trouble(vol);
                }
            }
        }

        if flags.contains(SetFlags::INVALIDATE) {
            let mut guard = self.inner.lock();
            let e = &mut guard.entries[buf.idx as usize];
            e.vol = NONE;
            e.block = NONE;
            e.dirty = false;
            e.valid = false;
        }

        if flags.contains(SetFlags::RELEASE) {
            let mut guard = self.inner.lock();
            let e = &mut guard.entries[buf.idx as usize];
            e.refcount = e.refcount.saturating_sub(1);
            let hit_zero = e.refcount == 0;
            drop(guard);
            if hit_zero {
                self.cache_ec.advance();
            }
        }

        Ok(())
    }

    /// Force-invalidates every entry matching `(vol, block)`, even if
    /// busy; any in-flight I/O result on that entry is discarded once it
    /// completes. `block == 0` additionally clears `vol`'s trouble bit
    /// (spec.md §4.2 "Trouble bit").
    pub fn invalidate(&self, vol: u32, block: u32) {
        let mut guard = self.inner.lock();
        for e in guard.entries.iter_mut() {
            if e.valid && e.vol == vol && e.block == block {
                e.vol = NONE;
                e.block = NONE;
                e.dirty = false;
                e.valid = false;
                e.busy = false;
            }
        }
        drop(guard);
        if block == 0 {
            self.trouble.lock().unwrap().remove(&vol);
        }
    }

    /// Opportunistically writes back dirty, idle, non-busy entries of
    /// `vol`. Busy entries are skipped, not waited for.
    pub fn update_vol(&self, vol: u32) {
        loop {
            let mut guard = self.inner.lock();
            let target = guard.entries.iter().position(|e| {
                e.valid && e.vol == vol && e.dirty && !e.busy && e.refcount == 0
            });
            let Some(idx) = target else { return };
            guard.entries[idx].busy = true;
            let mut data = guard.entries[idx].data;
            let block = guard.entries[idx].block;
            drop(guard);

            if self.device.io(vol as u16, block, IoDirection::Write, &mut data).is_err() {
                self.mark_trouble(vol);
            }

            let mut guard = self.inner.lock();
            guard.entries[idx].dirty = false;
            guard.entries[idx].busy = false;
        }
    }
}
