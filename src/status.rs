//! Shared error-code taxonomy.
//!
//! The original system tags every error as `(module << 16) | sub`. We
//! keep that shape (`Status::code()`) for wire compatibility with the
//! REM_FILE response format (§6), but expose it to Rust callers as an
//! ordinary `thiserror::Error` enum so `?` composes the way it does in
//! the rest of the crate.

use thiserror::Error;

/// A kernel module tag, used as the high 16 bits of a [`Status`] code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Module {
    Dbuf = 1,
    Bat = 2,
    Disk = 3,
    Sock = 4,
    Msg = 5,
    Netbuf = 6,
    Hint = 7,
    Route = 8,
    RemFile = 9,
    Time = 10,
    Glue = 11,
}

/// Local-recoverable, remote, I/O-transient, storage-damage, stale, and
/// fatal status codes, per spec.md §7.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    // -- Local recoverable --
    #[error("disk full")]
    DiskFull,
    #[error("volume not mounted")]
    VolumeNotMounted,
    #[error("volume in use")]
    VolumeInUse,
    #[error("volume table full")]
    VolumeTableFull,
    #[error("invalid block")]
    InvalidBlock,

    // -- Remote --
    #[error("remote node failed to respond")]
    RemoteNodeFailedToRespond,
    #[error("unexpected reply type")]
    UnexpectedReplyType,
    #[error("unknown network port")]
    UnknownNetworkPort,

    // -- I/O transient --
    #[error("disk write protected")]
    DiskWriteProtected,
    #[error("storage module stopped")]
    StorageModuleStopped,

    // -- Storage damage --
    #[error("volume needs salvaging")]
    NeedsSalvaging,

    // -- Stale --
    #[error("file not found")]
    FileNotFound,
    #[error("name not found")]
    NameNotFound,

    // -- Fatal (never returned; only passed to `crash_system`) --
    #[error("bad deferred interrupt")]
    BadDeferredInterrupt,
    #[error("controller error")]
    ControllerError,
    #[error("driver logic error")]
    DriverLogicErr,

    // -- Cancellation --
    #[error("quit signalled")]
    QuitSignalled,
    #[error("wait timed out")]
    TimedOut,

    // -- Generic cache-full / no-buffer conditions the teacher's arenas surface --
    #[error("no free buffer available")]
    NoBuffers,
    #[error("socket queue full")]
    QueueFull,
    #[error("socket not allocated")]
    SocketNotAllocated,
    #[error("socket already owned")]
    AlreadyOwned,
    #[error("packet exceeds socket's maximum queue entry size")]
    PacketTooLarge,
    #[error("no dynamic socket numbers available")]
    NoSocketsAvailable,
}

impl Status {
    /// The module this status is tagged with, used to build the wire code.
    pub const fn module(self) -> Module {
        use Status::*;
        match self {
            DiskFull | VolumeNotMounted | VolumeInUse | VolumeTableFull | InvalidBlock
            | NoBuffers => Module::Dbuf,
            NeedsSalvaging => Module::Bat,
            DiskWriteProtected | StorageModuleStopped => Module::Disk,
            SocketNotAllocated | AlreadyOwned | QueueFull | PacketTooLarge | NoSocketsAvailable => Module::Sock,
            QuitSignalled | TimedOut => Module::Msg,
            RemoteNodeFailedToRespond | UnexpectedReplyType | UnknownNetworkPort
            | FileNotFound | NameNotFound => Module::RemFile,
            BadDeferredInterrupt | ControllerError | DriverLogicErr => Module::Glue,
        }
    }

    /// The `(module << 16) | sub` wire-format status code from spec.md §7.
    pub const fn code(self) -> u32 {
        ((self.module() as u32) << 16) | (self as u32 & 0xFFFF)
    }

    /// True for the I/O-transient family that `dismount` and `dbuf::get_block`
    /// are permitted to swallow (spec.md §7).
    pub const fn is_io_transient(self) -> bool {
        matches!(self, Status::DiskWriteProtected | Status::StorageModuleStopped)
    }

    /// True for the Fatal family: callers must route these to
    /// [`crash_system`] rather than propagate them.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Status::BadDeferredInterrupt | Status::ControllerError | Status::DriverLogicErr
        )
    }
}

/// Halts the simulated kernel. Mirrors the teacher's "this must never
/// happen" panics (e.g. `Buf::drop` in `kernel-rs/src/bio.rs`) but takes
/// a `Status` so the log line carries the same taxonomy as every other
/// error path in this crate.
pub fn crash_system(status: Status) -> ! {
    log::error!(target: "domain_core::status", "fatal status {:?} (code {:#x}); crashing", status, status.code());
    panic!("crash_system: {status:?}");
}

pub type Result<T> = core::result::Result<T, Status>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_embeds_module() {
        assert_eq!(Status::DiskFull.code() >> 16, Module::Dbuf as u32);
        assert_eq!(Status::RemoteNodeFailedToRespond.code() >> 16, Module::RemFile as u32);
    }

    #[test]
    fn transient_classification() {
        assert!(Status::StorageModuleStopped.is_io_transient());
        assert!(!Status::DiskFull.is_io_transient());
    }
}
