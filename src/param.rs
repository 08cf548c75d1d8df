//! System-wide tunable constants.
//!
//! Mirrors the teacher's `param.rs`: a flat file of `const`s that the
//! rest of the crate imports instead of hard-coding magic numbers.

/// Size in bytes of one disk block / buffer-cache entry / VTOCE block.
pub const BSIZE: usize = 1024;

/// Lower bound on the number of disk-buffer-cache entries.
pub const DBUF_MIN: usize = 6;

/// Upper bound on the number of disk-buffer-cache entries.
pub const DBUF_MAX: usize = 64;

/// `real_pages / DBUF_DIVISOR` gives the cache size before clamping.
pub const DBUF_DIVISOR: usize = 64;

/// Number of bits in one BAT bitmap block (256 32-bit words).
pub const BAT_BITS_PER_BLOCK: u32 = 8192;

/// Number of 32-bit words in one BAT bitmap block.
pub const BAT_WORDS_PER_BLOCK: u32 = 256;

/// Maximum number of partitions per volume.
pub const MAX_PARTITIONS: usize = 131;

/// Maximum number of metadata entries held by one VTOCE block.
pub const VTOCE_ENTRIES_PER_BLOCK: u8 = 3;

/// VTOCE magic number stamped at a fixed offset in every valid VTOCE block.
pub const VTOCE_MAGIC: u32 = 0xFEDC_A984;

/// Unexplained reserve overhead carried by every old-format volume.
/// §9 Open Behavioral Questions: preserved as a named constant, not rederived.
pub const OLD_FORMAT_RESERVE_BUFFER: u32 = 11;

/// Number of fixed volume-manager slots (PVs and LVs together).
pub const DISK_SLOTS: usize = 11;

/// Number of fixed socket descriptors.
pub const NSOCK: usize = 224;

/// Socket numbers below this are well-known (statically reserved); at or
/// above it, numbers are handed out dynamically.
pub const SOCK_DYNAMIC_BASE: u16 = 32;

/// Number of header pool virtual-address slots.
pub const NETBUF_HDR_SLOTS: usize = 192;

/// Lower bound on the number of network data pages kept in the pool.
pub const NETBUF_DATA_MIN: usize = 10;

/// Number of fixed routing ports.
pub const NROUTE_PORTS: usize = 8;

/// Number of address-space ids trackable per socket-ownership bitmap.
pub const MAX_ASID: usize = 64;

/// Hint-file hash-bucket count.
pub const HINT_BUCKETS: usize = 64;

/// Slots per hint-file bucket.
pub const HINT_SLOTS_PER_BUCKET: usize = 3;

/// Node-id/contact pairs kept per hint slot.
pub const HINT_CONTACTS_PER_SLOT: usize = 3;

/// Small in-memory lookup cache in front of the hint file.
pub const HINT_CACHE_ENTRIES: usize = 2;

/// Expiry, in clock ticks, of an entry in the small hint cache.
pub const HINT_CACHE_TTL_TICKS: u64 = 240;

/// Hint-file format version stamped in the header once initialized.
pub const HINT_FILE_VERSION: u32 = 7;

/// Default maximum number of RPC retries before giving up on a peer.
pub const REMFILE_MAX_RETRIES: u32 = 4;

/// Retries after which a non-mother-node destination is probed for liveness.
pub const REMFILE_PROBE_AFTER_RETRIES: u32 = 2;

/// Response-type sentinel meaning "stale entry, invalidate your cache".
pub const REMFILE_STALE_SENTINEL: u16 = 0xFFFF;

/// Response magic byte (first byte of every REM_FILE server reply).
pub const REMFILE_RESPONSE_MAGIC: u8 = 0x80;

/// Maximum reply payload size, in bytes, of a REM_FILE response.
pub const REMFILE_MAX_REPLY: usize = 0x100;

/// Maximum UID-collision retries when minting a fresh UID for `generate_uid`.
pub const UID_GENERATE_RETRIES: u32 = 10;
