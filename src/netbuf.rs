//! Network buffer pool (spec.md §4.6).
//!
//! Two independent pools — header buffers and payload data pages — each a
//! free list of owned [`BSIZE`]-byte buffers with a floor/ceiling computed
//! from "real memory" at init (spec.md §5 "Resource ceilings"). The
//! original links free buffers by page-frame index inside a fixed virtual
//! window; since nothing downstream of this crate cares about the actual
//! page-frame identity, we hand out owned `Box<[u8; BSIZE]>` buffers
//! directly rather than reimplementing an index arena for values that
//! are moved, never aliased — the arena-plus-index pattern spec.md §9
//! recommends is for *pointer graphs* (LRU lists, queues), which this
//! isn't. Only [`NetBuf::get_hdr`]/[`NetBuf::get_dat`] calls make by a
//! network server thread are allowed to block when the pool is
//! momentarily empty; every other caller gets a freshly grown buffer
//! instead, mirroring the teacher's `kernel-rs/src/pool.rs` fixed-pool
//! pattern but relaxed at the edges the spec calls out explicitly.

use std::collections::VecDeque;

use crate::lock::{EventCount, SpinLock};
use crate::param::{BSIZE, NETBUF_DATA_MIN};

type Buf = Box<[u8; BSIZE]>;

fn fresh_buf() -> Buf {
    Box::new([0u8; BSIZE])
}

struct Pool {
    free: VecDeque<Buf>,
    ceiling: usize,
}

/// The network buffer pool: one free list for headers, one for data
/// pages, each signalling availability through one shared event count
/// (spec.md §4.1: NETBUF's "pool-not-empty" event count).
pub struct NetBuf {
    hdrs: SpinLock<Pool>,
    data: SpinLock<Pool>,
    avail_ec: EventCount,
}

impl NetBuf {
    /// `real_pages` stands in for the external page allocator's view of
    /// installed memory; header ceiling clamps to `[6, 64]`, data ceiling
    /// to `[NETBUF_DATA_MIN, real_pages / 2]` (spec.md §5).
    pub fn new(real_pages: usize) -> Self {
        let hdr_ceiling = (real_pages / 64).clamp(6, 64);
        let data_ceiling = (real_pages / 2).max(NETBUF_DATA_MIN);

        let mut hdr_free = VecDeque::new();
        for _ in 0..hdr_ceiling.min(6) {
            hdr_free.push_back(fresh_buf());
        }
        let mut data_free = VecDeque::new();
        for _ in 0..NETBUF_DATA_MIN {
            data_free.push_back(fresh_buf());
        }

        Self {
            hdrs: SpinLock::new("netbuf_hdrs", Pool { free: hdr_free, ceiling: hdr_ceiling }),
            data: SpinLock::new("netbuf_data", Pool { free: data_free, ceiling: data_ceiling }),
            avail_ec: EventCount::new(),
        }
    }

    fn take(pool: &SpinLock<Pool>, avail_ec: &EventCount, is_server: bool) -> Buf {
        loop {
            if let Some(b) = pool.lock().free.pop_front() {
                return b;
            }
            if !is_server {
                return fresh_buf();
            }
            let target = avail_ec.read() + 1;
            avail_ec.wait(target);
        }
    }

    fn give(pool: &SpinLock<Pool>, avail_ec: &EventCount, buf: Buf) {
        let mut p = pool.lock();
        if p.free.len() < p.ceiling {
            p.free.push_back(buf);
        }
        drop(p);
        avail_ec.advance();
    }

    /// Allocates a header buffer, blocking only if `is_server` and the
    /// pool is momentarily empty.
    pub fn get_hdr(&self, is_server: bool) -> Buf {
        Self::take(&self.hdrs, &self.avail_ec, is_server)
    }

    /// Returns `buf` to the header free list, or drops it if the pool is
    /// already at its ceiling.
    pub fn return_hdr(&self, buf: Buf) {
        Self::give(&self.hdrs, &self.avail_ec, buf)
    }

    pub fn get_dat(&self, is_server: bool) -> Buf {
        Self::take(&self.data, &self.avail_ec, is_server)
    }

    pub fn return_dat(&self, buf: Buf) {
        Self::give(&self.data, &self.avail_ec, buf)
    }

    /// Trims any surplus above each pool's current ceiling; called after
    /// a ceiling recomputation (spec.md §5: "on over-allocation, the
    /// extra is trimmed on the next `add_pages`").
    pub fn add_pages(&self, new_hdr_ceiling: usize, new_data_ceiling: usize) {
        let mut h = self.hdrs.lock();
        h.ceiling = new_hdr_ceiling;
        while h.free.len() > h.ceiling {
            h.free.pop_back();
        }
        drop(h);
        let mut d = self.data.lock();
        d.ceiling = new_data_ceiling;
        while d.free.len() > d.ceiling {
            d.free.pop_back();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_server_grows_on_demand() {
        let nb = NetBuf::new(64 * 64);
        let mut bufs = vec![];
        for _ in 0..20 {
            bufs.push(nb.get_hdr(false));
        }
        // All 20 succeed even though the prefilled pool only had 6.
        assert_eq!(bufs.len(), 20);
    }

    #[test]
    fn returned_buffer_is_reused() {
        let nb = NetBuf::new(64 * 64);
        let b = nb.get_dat(false);
        nb.return_dat(b);
        let pending = nb.data.lock().free.len();
        assert_eq!(pending, NETBUF_DATA_MIN);
    }

    #[test]
    fn surplus_above_ceiling_is_dropped_on_return() {
        let nb = NetBuf::new(64 * 64);
        nb.add_pages(6, 1);
        let a = nb.get_dat(false);
        let b = nb.get_dat(false);
        nb.return_dat(a);
        nb.return_dat(b);
        assert!(nb.data.lock().free.len() <= 1);
    }
}
