//! HINT: cached node-location lookups for remote-file operations
//! (spec.md §4.7).
//!
//! A 64-bucket × 3-slot × 3-contact hash table keyed by `uid.node_mask()`,
//! backed by a disk-resident file in the real system and modeled here as
//! an in-memory table behind one [`ExclLock`] (spec.md §5: HINT's
//! exclusion lock guards the whole file, same granularity as
//! `kernel-rs`'s inode-table lock). A tiny two-entry, 240-tick front cache
//! sits in front of it to absorb the hot path of repeated lookups for the
//! same object.

use crate::clock::Clock;
use crate::param::{
    HINT_BUCKETS, HINT_CACHE_ENTRIES, HINT_CACHE_TTL_TICKS, HINT_CONTACTS_PER_SLOT,
    HINT_FILE_VERSION, HINT_SLOTS_PER_BUCKET,
};
use crate::lock::ExclLock;
use crate::uid::Uid;

/// One `(flags, node_id)` location hint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Contact {
    pub flags: u32,
    pub node_id: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    key: u32,
    in_use: bool,
    contacts: [Contact; HINT_CONTACTS_PER_SLOT],
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    slots: [Slot; HINT_SLOTS_PER_BUCKET],
    round_robin: usize,
}

impl Default for Bucket {
    fn default() -> Self {
        Self {
            slots: [Slot::default(); HINT_SLOTS_PER_BUCKET],
            round_robin: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CacheEntry {
    key: u32,
    timestamp: u64,
    contact: Contact,
    valid: bool,
}

struct Inner {
    version: u32,
    net_port: u32,
    net_info: u32,
    buckets: Vec<Bucket>,
    cache: [CacheEntry; HINT_CACHE_ENTRIES],
    cache_index: usize,
}

/// HINT lookup table plus the front cache.
pub struct Hint {
    inner: ExclLock<Inner>,
}

fn bucket_index(key: u32) -> usize {
    (key as usize) % HINT_BUCKETS
}

impl Hint {
    /// A freshly reinitialized hint file (spec.md §4.7 "clear"): version
    /// stamped, all buckets empty, net info recorded from the local route
    /// port.
    pub fn new(net_port: u32, net_info: u32) -> Self {
        Self {
            inner: ExclLock::new(
                "hint_file",
                Inner {
                    version: HINT_FILE_VERSION,
                    net_port,
                    net_info,
                    buckets: vec![Bucket::default(); HINT_BUCKETS],
                    cache: [CacheEntry::default(); HINT_CACHE_ENTRIES],
                    cache_index: 0,
                },
            ),
        }
    }

    pub fn version(&self) -> u32 {
        self.inner.lock().version
    }

    /// Adds or updates the hints for `uid`. On hitting an existing slot,
    /// shifts the new contact to the front (most-recently-seen first); on
    /// a miss, allocates the first empty slot in the bucket or, if the
    /// bucket is full, round-robins over its slots. A contact whose
    /// `node_id` equals the uid's own node is dropped rather than stored,
    /// mirroring the original's self-reference guard.
    pub fn add(&self, uid: Uid, contact: Contact) {
        if contact.node_id == uid.high {
            return;
        }
        let key = uid.node_mask();
        let mut inner = self.inner.lock();
        let idx = bucket_index(key);
        let bucket = &mut inner.buckets[idx];

        if let Some(slot) = bucket.slots.iter_mut().find(|s| s.in_use && s.key == key) {
            shift_front(slot, contact);
            return;
        }

        if let Some(slot) = bucket.slots.iter_mut().find(|s| !s.in_use) {
            slot.in_use = true;
            slot.key = key;
            slot.contacts = [Contact::default(); HINT_CONTACTS_PER_SLOT];
            slot.contacts[0] = contact;
            return;
        }

        let victim = bucket.round_robin % HINT_SLOTS_PER_BUCKET;
        bucket.round_robin = (bucket.round_robin + 1) % HINT_SLOTS_PER_BUCKET;
        let slot = &mut bucket.slots[victim];
        slot.in_use = true;
        slot.key = key;
        slot.contacts = [Contact::default(); HINT_CONTACTS_PER_SLOT];
        slot.contacts[0] = contact;
    }

    /// Looks up the best-known contact for `uid`, trying the small front
    /// cache first and falling back to the hash table on a miss or an
    /// expired cache entry.
    pub fn lookup(&self, clock: &dyn Clock, uid: Uid) -> Option<Contact> {
        let key = uid.node_mask();
        let now = clock.abs_clock();
        let mut inner = self.inner.lock();

        for entry in inner.cache.iter() {
            if entry.valid
                && entry.key == key
                && now.saturating_sub(entry.timestamp) < HINT_CACHE_TTL_TICKS
            {
                return Some(entry.contact);
            }
        }

        let idx = bucket_index(key);
        let found = inner.buckets[idx]
            .slots
            .iter()
            .find(|s| s.in_use && s.key == key)
            .map(|s| s.contacts[0])
            .filter(|c| *c != Contact::default());

        if let Some(contact) = found {
            let cache_idx = inner.cache_index;
            inner.cache[cache_idx] = CacheEntry {
                key,
                timestamp: now,
                contact,
                valid: true,
            };
            inner.cache_index = (cache_idx + 1) % HINT_CACHE_ENTRIES;
        }
        found
    }

    /// Removes every trace of `uid`, used when a remote-file stale-entry
    /// sentinel (spec.md §4.8) tells a client its cached location is wrong.
    pub fn invalidate(&self, uid: Uid) {
        let key = uid.node_mask();
        let mut inner = self.inner.lock();
        let idx = bucket_index(key);
        for slot in inner.buckets[idx].slots.iter_mut() {
            if slot.in_use && slot.key == key {
                *slot = Slot::default();
            }
        }
        for entry in inner.cache.iter_mut() {
            if entry.valid && entry.key == key {
                entry.valid = false;
            }
        }
    }
}

fn shift_front(slot: &mut Slot, contact: Contact) {
    if slot.contacts[0] == contact {
        return;
    }
    for i in (1..HINT_CONTACTS_PER_SLOT).rev() {
        slot.contacts[i] = slot.contacts[i - 1];
    }
    slot.contacts[0] = contact;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn uid(node: u32, low: u32) -> Uid {
        Uid::new(node, low)
    }

    #[test]
    fn add_then_lookup_round_trips() {
        let hint = Hint::new(1, 2);
        let clock = FakeClock::new();
        let u = uid(9, 0x1234);
        hint.add(u, Contact { flags: 1, node_id: 5 });
        assert_eq!(hint.lookup(&clock, u), Some(Contact { flags: 1, node_id: 5 }));
    }

    #[test]
    fn self_reference_is_dropped() {
        let hint = Hint::new(1, 2);
        let clock = FakeClock::new();
        let u = uid(9, 0x1234);
        hint.add(u, Contact { flags: 0, node_id: 9 });
        assert_eq!(hint.lookup(&clock, u), None);
    }

    #[test]
    fn invalidate_clears_both_cache_and_bucket() {
        let hint = Hint::new(1, 2);
        let clock = FakeClock::new();
        let u = uid(9, 0x1234);
        hint.add(u, Contact { flags: 1, node_id: 5 });
        hint.lookup(&clock, u); // populates the front cache
        hint.invalidate(u);
        assert_eq!(hint.lookup(&clock, u), None);
    }

    #[test]
    fn stale_cache_entry_falls_back_to_bucket() {
        let hint = Hint::new(1, 2);
        let clock = FakeClock::new();
        let u = uid(9, 0x1234);
        hint.add(u, Contact { flags: 1, node_id: 5 });
        hint.lookup(&clock, u); // populates the front cache
        clock.advance(HINT_CACHE_TTL_TICKS + 1);
        // The front cache entry is now past its TTL, but the backing
        // bucket still has it: lookup must still find it.
        assert_eq!(hint.lookup(&clock, u), Some(Contact { flags: 1, node_id: 5 }));
    }

    #[test]
    fn round_robins_once_bucket_is_full() {
        let hint = Hint::new(1, 2);
        // Three UIDs that collide into the same bucket (same node_mask
        // modulo HINT_BUCKETS), a fourth evicts one of the first three.
        let base = 9;
        let u0 = uid(base, 0);
        let u1 = uid(base, HINT_BUCKETS as u32);
        let u2 = uid(base, 2 * HINT_BUCKETS as u32);
        let u3 = uid(base, 3 * HINT_BUCKETS as u32);
        hint.add(u0, Contact { flags: 0, node_id: 1 });
        hint.add(u1, Contact { flags: 0, node_id: 2 });
        hint.add(u2, Contact { flags: 0, node_id: 3 });
        hint.add(u3, Contact { flags: 0, node_id: 4 });
        let clock = FakeClock::new();
        let mut present = 0;
        for u in [u0, u1, u2, u3] {
            if hint.lookup(&clock, u).is_some() {
                present += 1;
            }
        }
        assert_eq!(present, HINT_SLOTS_PER_BUCKET);
    }
}
