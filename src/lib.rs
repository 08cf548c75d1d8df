//! Storage-and-networking core of a late-1980s workstation OS kernel,
//! hosted on a general-purpose target instead of bare metal (spec.md §1).
//!
//! Module layout mirrors the teacher's flat `kernel-rs/src` tree: leaf
//! primitives first (`lock`, `clock`, `uid`, `status`), then the storage
//! stack (`dbuf`, `bat`, `disk`, `driver`), then the networking stack
//! (`netbuf`, `netpkt`, `sock`, `msg`, `hint`, `route`), then the
//! remote-file RPC layer (`remfile`) and the shared timer queue (`timerq`).
//! There is no scheduler module because spec.md §1 lists process
//! management and scheduling as an external collaborator, consumed only
//! as "current ASID" (see [`ctx`]).

pub mod bat;
pub mod clock;
pub mod ctx;
pub mod dbuf;
pub mod disk;
pub mod driver;
pub mod hint;
pub mod lock;
pub mod msg;
pub mod netbuf;
pub mod netpkt;
pub mod param;
pub mod remfile;
pub mod route;
pub mod sock;
pub mod status;
pub mod timerq;
pub mod uid;

use std::sync::Arc;

use clock::Clock;
use driver::BlockDevice;

/// Every subsystem wired together, the hosted analogue of the teacher's
/// `kernel-rs/src/kernel.rs` (removed in the trim pass — its bare-metal
/// boot sequence has no counterpart here; see DESIGN.md). Construction
/// order doesn't matter: nothing below borrows another field, since every
/// cross-module call takes its collaborators as explicit arguments
/// (`&self.dbuf`, `&self.clock`, ...) rather than reaching through `self`.
pub struct System {
    pub dbuf: dbuf::Dbuf,
    pub bat: bat::Bat,
    pub disk: disk::Disk,
    pub netbuf: netbuf::NetBuf,
    pub sock: sock::Sock,
    pub msg: msg::Msg,
    pub hint: hint::Hint,
    pub route: route::Route,
    pub timerq: timerq::TimerQueue,
    pub quit: ctx::QuitTable,
    pub visibility: remfile::NodeVisibility,
    pub clock: Arc<dyn Clock>,
}

impl System {
    /// `real_pages` is the external page allocator's view of installed
    /// memory (spec.md §5 "Resource ceilings"), `boot_device` backs the
    /// buffer cache's own I/O, and `net_port`/`net_info` seed HINT's
    /// local-node identity (spec.md §4.7).
    pub fn new(
        real_pages: usize,
        boot_device: Arc<dyn BlockDevice>,
        net_port: u32,
        net_info: u32,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            dbuf: dbuf::Dbuf::new(real_pages, boot_device),
            bat: bat::Bat::new(),
            disk: disk::Disk::new(),
            netbuf: netbuf::NetBuf::new(real_pages),
            sock: sock::Sock::new(),
            msg: msg::Msg::new(),
            hint: hint::Hint::new(net_port, net_info),
            route: route::Route::new(),
            timerq: timerq::TimerQueue::new(),
            quit: ctx::QuitTable::new(),
            visibility: remfile::NodeVisibility::new(),
            clock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryBlockDevice;

    #[test]
    fn system_wires_every_subsystem() {
        let system = System::new(
            4096,
            Arc::new(MemoryBlockDevice::new()),
            1,
            1,
            Arc::new(clock::SystemClock),
        );
        assert!(system.hint.version() >= 1);
        assert!(!system.msg.is_owned(0));
    }
}
