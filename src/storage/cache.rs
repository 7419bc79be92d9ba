//! # Block Cache with CLOCK Eviction
//!
//! A process-wide, fixed-capacity pool of pinned sector buffers. Every tree
//! descent goes through here; devices are only touched on a miss or when a
//! dirty victim is written back.
//!
//! ## Addressing
//!
//! Entries are found through an open-addressing hash table keyed by
//! `(DeviceId, Lba)` with linear probing. Deletion writes a *tombstone*
//! instead of compacting, so probe sequences of colliding entries that are
//! still resident keep working:
//!
//! ```text
//! buckets: [ A ][ B ][ ∅ ]        A and B collide on bucket 0
//! remove A
//! buckets: [ † ][ B ][ ∅ ]        probe for B crosses the tombstone
//! ```
//!
//! One entry can be published under up to [`MAX_LOCATIONS`] aliases at once;
//! a sector staged by [`BlockCache::allocate`] has no alias at all until
//! [`BlockCache::set_lba`] binds one, and is invisible to lookups until then.
//!
//! ## Eviction
//!
//! CLOCK (second chance): a hand cycles over the pool and
//!
//! - skips pinned, leader, and transaction-owned entries,
//! - clears-and-skips the accessed flag,
//! - writes back every valid alias of a dirty entry, then
//! - reclaims the first entry with nothing left to do, dropping all of its
//!   aliases from the table.
//!
//! A full revolution without finding a victim or changing any state means
//! every entry is pinned down and the caller gets
//! [`Error::CacheExhausted`](crate::Error::CacheExhausted).
//!
//! ## Pinning and transaction ownership
//!
//! Every lookup/allocate pins its entry (lock count); each pin must be
//! matched by exactly one [`BlockCache::release`]. The first release of an
//! entry that was allocated inside a transaction links it onto that
//! transaction's owned list; [`BlockCache::end_transaction`] later clears the
//! allocated/transactional marks, making the entry an ordinary resident,
//! evictable sector.
//!
//! ## Thread Safety
//!
//! One `parking_lot::Mutex` guards the pool, the table, and the hand.
//! Per-entry lock counts are bare pins, not reader/writer locks; concurrent
//! writers need the serialization the transaction layer provides.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::{MAX_LOCATIONS, SECTOR_SIZE};
use crate::error::{verify, Error, Result};
use crate::txn::TxnId;
use crate::types::Lba;

use super::device::BlockDevice;

/// Identity of a registered device, assigned by [`BlockCache::register_device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(u32);

/// Handle to a pinned cache entry. Only valid while the pin is held (or, for
/// transaction-owned entries, until the transaction ends).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryId(u32);

#[derive(Debug, Clone, Copy)]
struct Location {
    device: DeviceId,
    lba: Lba,
    valid: bool,
    transactional: bool,
}

const NO_LOCATION: Location = Location {
    device: DeviceId(0),
    lba: Lba(0),
    valid: false,
    transactional: false,
};

struct CacheEntry {
    buf: Box<[u8]>,
    locked: u32,
    allocated: bool,
    accessed: bool,
    dirty: bool,
    leader: bool,
    owner: Option<TxnId>,
    locations: [Location; MAX_LOCATIONS],
}

impl CacheEntry {
    fn new() -> Self {
        Self {
            buf: vec![0u8; SECTOR_SIZE].into_boxed_slice(),
            locked: 0,
            allocated: false,
            accessed: false,
            dirty: false,
            leader: false,
            owner: None,
            locations: [NO_LOCATION; MAX_LOCATIONS],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bucket {
    Empty,
    Tombstone,
    Occupied(u32),
}

struct CacheInner {
    entries: Vec<CacheEntry>,
    buckets: Vec<Bucket>,
    hand: usize,
    devices: Vec<Arc<dyn BlockDevice>>,
}

/// Process-wide pool of pinned, lockable sector buffers.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
}

impl core::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockCache").finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Create a cache with `cache_entries` slots. The hash table gets
    /// `MAX_LOCATIONS` buckets per slot so it can never fill up.
    pub fn new(cache_entries: usize) -> Arc<Self> {
        let cache_entries = cache_entries.max(1);
        Arc::new(Self {
            inner: Mutex::new(CacheInner {
                entries: (0..cache_entries).map(|_| CacheEntry::new()).collect(),
                buckets: vec![Bucket::Empty; MAX_LOCATIONS * cache_entries],
                hand: 0,
                devices: Vec::new(),
            }),
        })
    }

    /// Register a device for caching and write-back. The returned id is the
    /// device's identity in every alias.
    pub fn register_device(&self, device: Arc<dyn BlockDevice>) -> DeviceId {
        let mut inner = self.inner.lock();
        inner.devices.push(device);
        DeviceId(inner.devices.len() as u32 - 1)
    }

    /// Look up a sector for reading, loading it from the device on a miss.
    /// The entry comes back pinned.
    pub fn read_lookup(&self, txn: TxnId, device: DeviceId, lba: Lba) -> Result<EntryId> {
        self.inner.lock().lookup(txn, device, lba, false)
    }

    /// Like [`read_lookup`](Self::read_lookup) but marks the entry dirty.
    pub fn read_write_lookup(&self, txn: TxnId, device: DeviceId, lba: Lba) -> Result<EntryId> {
        self.inner.lock().lookup(txn, device, lba, true)
    }

    /// Stage a sector that has no backing address yet. The entry is pinned,
    /// dirty, zero-filled, flagged as allocated-but-uncommitted, and excluded
    /// from lookups until [`set_lba`](Self::set_lba) binds an address.
    pub fn allocate(&self, _txn: TxnId) -> Result<EntryId> {
        let mut inner = self.inner.lock();
        let idx = inner.find_victim()?;

        let entry = &mut inner.entries[idx];
        entry.buf.fill(0);
        entry.locked = 1;
        entry.allocated = true;
        entry.accessed = true;
        entry.dirty = true;
        entry.leader = false;
        entry.owner = None;

        Ok(EntryId(idx as u32))
    }

    /// Bind one of the entry's alias slots to `(device, lba)` and publish it
    /// in the hash table. While the entry is still transaction-owned the
    /// alias is marked transactional so the owning transaction can downgrade
    /// it at commit.
    pub fn set_lba(&self, id: EntryId, device: DeviceId, lba: Lba) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.bind_alias(id.0 as usize, device, lba)
    }

    /// Drop one pin. The first release of an entry allocated inside a
    /// transaction records it on `owned`, transferring ownership to that
    /// transaction until [`end_transaction`](Self::end_transaction).
    pub fn release(&self, id: EntryId, txn: TxnId, owned: &mut Vec<EntryId>) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[id.0 as usize];

        verify!(entry.locked > 0, "release of an unpinned cache entry");

        if entry.allocated && entry.owner.is_none() {
            entry.owner = Some(txn);
            owned.push(id);
        }

        entry.locked -= 1;
        Ok(())
    }

    /// Clear the allocated/transactional marks of every entry a finished
    /// transaction owns. The entries stay resident and become ordinary
    /// evictable cache state.
    pub fn end_transaction(&self, owned: &[EntryId]) {
        let mut inner = self.inner.lock();
        for id in owned {
            let entry = &mut inner.entries[id.0 as usize];
            entry.allocated = false;
            entry.owner = None;
            for location in &mut entry.locations {
                location.transactional = false;
            }
        }
    }

    /// Exempt a dirty, committed entry from eviction.
    pub fn set_leader(&self, id: EntryId) -> Result<()> {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[id.0 as usize];

        verify!(!entry.allocated, "leader mark on an uncommitted entry");
        verify!(entry.dirty, "leader mark on a clean entry");
        verify!(!entry.leader, "entry is already a leader");

        entry.leader = true;
        Ok(())
    }

    /// Run `f` over the entry's sector bytes.
    pub fn with_entry<R>(&self, id: EntryId, f: impl FnOnce(&[u8]) -> R) -> R {
        let inner = self.inner.lock();
        let entry = &inner.entries[id.0 as usize];
        debug_assert!(entry.locked > 0, "unpinned entry access");
        f(&entry.buf)
    }

    /// Run `f` over the entry's sector bytes mutably.
    pub fn with_entry_mut<R>(&self, id: EntryId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.lock();
        let entry = &mut inner.entries[id.0 as usize];
        debug_assert!(entry.locked > 0, "unpinned entry access");
        f(&mut entry.buf)
    }

    /// Whether `(device, lba)` is resident (test and diagnostics hook).
    pub fn contains(&self, device: DeviceId, lba: Lba) -> bool {
        self.inner.lock().find_alias(device, lba).is_some()
    }

    /// Number of cache slots.
    pub fn capacity(&self) -> usize {
        self.inner.lock().entries.len()
    }
}

impl CacheInner {
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn home_bucket(&self, device: DeviceId, lba: Lba) -> usize {
        let mix = (device.0 as u64 ^ lba.0 ^ (lba.0 >> 32)) as usize;
        mix % self.bucket_count()
    }

    /// Probe for an entry with a valid alias equal to `(device, lba)`.
    fn find_alias(&self, device: DeviceId, lba: Lba) -> Option<(usize, usize)> {
        let mut bucket = self.home_bucket(device, lba);
        for _ in 0..self.bucket_count() {
            match self.buckets[bucket] {
                Bucket::Empty => return None,
                Bucket::Tombstone => {}
                Bucket::Occupied(idx) => {
                    let entry = &self.entries[idx as usize];
                    let matches = entry.locations.iter().any(|loc| {
                        loc.valid && loc.device == device && loc.lba == lba
                    });
                    if matches {
                        return Some((bucket, idx as usize));
                    }
                }
            }
            bucket = (bucket + 1) % self.bucket_count();
        }
        None
    }

    fn publish_alias(&mut self, device: DeviceId, lba: Lba, idx: usize) {
        let mut bucket = self.home_bucket(device, lba);
        loop {
            match self.buckets[bucket] {
                Bucket::Empty | Bucket::Tombstone => {
                    self.buckets[bucket] = Bucket::Occupied(idx as u32);
                    return;
                }
                Bucket::Occupied(_) => bucket = (bucket + 1) % self.bucket_count(),
            }
        }
    }

    /// Tombstone the bucket publishing `idx` under `(device, lba)`.
    fn retract_alias(&mut self, device: DeviceId, lba: Lba, idx: usize) -> Result<()> {
        let mut bucket = self.home_bucket(device, lba);
        for _ in 0..self.bucket_count() {
            match self.buckets[bucket] {
                Bucket::Empty => break,
                Bucket::Occupied(occupant) if occupant as usize == idx => {
                    self.buckets[bucket] = Bucket::Tombstone;
                    return Ok(());
                }
                _ => {}
            }
            bucket = (bucket + 1) % self.bucket_count();
        }
        Err(Error::corruption(format!(
            "alias ({device:?}, {lba}) missing from the hash table"
        )))
    }

    fn bind_alias(&mut self, idx: usize, device: DeviceId, lba: Lba) -> Result<()> {
        let allocated = self.entries[idx].allocated;
        let slot = self.entries[idx]
            .locations
            .iter()
            .position(|loc| !loc.valid)
            .ok_or_else(|| {
                Error::corruption(format!("cache entry already has {MAX_LOCATIONS} aliases"))
            })?;

        self.entries[idx].locations[slot] = Location {
            device,
            lba,
            valid: true,
            transactional: allocated,
        };
        self.publish_alias(device, lba, idx);
        Ok(())
    }

    /// CLOCK scan for a reusable slot. Write-back and flag clearing count as
    /// progress; a full revolution without progress means everything is
    /// pinned down.
    fn find_victim(&mut self) -> Result<usize> {
        let count = self.entries.len();
        let mut fruitless = 0;

        loop {
            if fruitless >= count {
                return Err(Error::CacheExhausted);
            }

            let idx = self.hand;
            self.hand = (self.hand + 1) % count;

            let entry = &mut self.entries[idx];

            if entry.locked > 0 || entry.leader || entry.allocated {
                fruitless += 1;
                continue;
            }

            if entry.accessed {
                entry.accessed = false;
                fruitless = 0;
                continue;
            }

            if entry.dirty {
                self.write_back(idx)?;
                fruitless = 0;
                continue;
            }

            // Reusable: retire every published alias.
            for slot in 0..MAX_LOCATIONS {
                let location = self.entries[idx].locations[slot];
                if location.valid {
                    self.retract_alias(location.device, location.lba, idx)?;
                    self.entries[idx].locations[slot].valid = false;
                }
            }
            trace!(entry = idx, "cache entry evicted");
            return Ok(idx);
        }
    }

    fn write_back(&mut self, idx: usize) -> Result<()> {
        for slot in 0..MAX_LOCATIONS {
            let location = self.entries[idx].locations[slot];
            if !location.valid {
                continue;
            }
            verify!(
                !location.transactional,
                "write-back of a transactional alias at {}",
                location.lba
            );
            let device = Arc::clone(&self.devices[location.device.0 as usize]);
            device.write_sector(location.lba, &self.entries[idx].buf)?;
            trace!(entry = idx, lba = location.lba.0, "dirty sector written back");
        }
        self.entries[idx].dirty = false;
        Ok(())
    }

    fn lookup(&mut self, txn: TxnId, device: DeviceId, lba: Lba, write: bool) -> Result<EntryId> {
        if let Some((_, idx)) = self.find_alias(device, lba) {
            let entry = &mut self.entries[idx];

            if entry.allocated && entry.owner != Some(txn) {
                return Err(Error::corruption(format!(
                    "{lba} is an uncommitted sector of another transaction"
                )));
            }

            // Pins stack: published sectors are immutable, so concurrent
            // readers of the same sector share the entry.
            entry.locked += 1;
            entry.accessed = true;
            if write {
                entry.dirty = true;
            }
            return Ok(EntryId(idx as u32));
        }

        // Miss: claim a slot and read the sector in.
        let idx = self.find_victim()?;
        let backing = Arc::clone(&self.devices[device.0 as usize]);
        backing.read_sector(lba, &mut self.entries[idx].buf)?;

        let entry = &mut self.entries[idx];
        entry.locked = 1;
        entry.allocated = false;
        entry.accessed = true;
        entry.dirty = write;
        entry.leader = false;
        entry.owner = None;

        self.bind_alias(idx, device, lba)?;
        Ok(EntryId(idx as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::device::MemDevice;

    const TXN: TxnId = 1;
    const OTHER_TXN: TxnId = 2;

    fn cache_with_device(entries: usize, sectors: u64) -> (Arc<BlockCache>, DeviceId, Arc<MemDevice>) {
        let device = Arc::new(MemDevice::new(sectors));
        let cache = BlockCache::new(entries);
        let id = cache.register_device(device.clone());
        (cache, id, device)
    }

    fn release(cache: &BlockCache, id: EntryId) {
        let mut owned = Vec::new();
        cache.release(id, TXN, &mut owned).unwrap();
        assert!(owned.is_empty());
    }

    #[test]
    fn lookup_miss_reads_from_device() {
        let (cache, dev, device) = cache_with_device(4, 8);

        let mut sector = vec![0u8; SECTOR_SIZE];
        sector[0] = 0x5A;
        device.write_sector(Lba(3), &sector).unwrap();

        let entry = cache.read_lookup(TXN, dev, Lba(3)).unwrap();
        assert_eq!(cache.with_entry(entry, |buf| buf[0]), 0x5A);
        release(&cache, entry);

        // Second lookup is a hit on the same slot.
        let again = cache.read_lookup(TXN, dev, Lba(3)).unwrap();
        assert_eq!(again, entry);
        release(&cache, again);
    }

    #[test]
    fn pinned_entries_survive_eviction_pressure() {
        let (cache, dev, _) = cache_with_device(2, 16);

        let pinned = cache.read_lookup(TXN, dev, Lba(0)).unwrap();

        for lba in 1..6 {
            let entry = cache.read_lookup(TXN, dev, Lba(lba)).unwrap();
            release(&cache, entry);
        }

        assert!(cache.contains(dev, Lba(0)));
        release(&cache, pinned);
    }

    #[test]
    fn clock_gives_accessed_entries_a_second_chance() {
        let (cache, dev, _) = cache_with_device(2, 16);

        let a = cache.read_lookup(TXN, dev, Lba(0)).unwrap();
        release(&cache, a);
        let b = cache.read_lookup(TXN, dev, Lba(1)).unwrap();
        release(&cache, b);

        // Both are accessed; the hand strips both flags and then takes the
        // first entry it revisits, which held lba 0.
        let c = cache.read_lookup(TXN, dev, Lba(2)).unwrap();
        release(&cache, c);

        assert!(!cache.contains(dev, Lba(0)));
        assert!(cache.contains(dev, Lba(1)));
    }

    #[test]
    fn dirty_victim_is_written_back() {
        let (cache, dev, device) = cache_with_device(1, 8);

        let entry = cache.read_write_lookup(TXN, dev, Lba(5)).unwrap();
        cache.with_entry_mut(entry, |buf| buf[7] = 0x77);
        release(&cache, entry);

        // The only slot must be recycled, forcing write-back of lba 5.
        let other = cache.read_lookup(TXN, dev, Lba(6)).unwrap();
        release(&cache, other);

        let mut sector = vec![0u8; SECTOR_SIZE];
        device.read_sector(Lba(5), &mut sector).unwrap();
        assert_eq!(sector[7], 0x77);
    }

    #[test]
    fn tombstone_preserves_colliding_probe_chains() {
        let (cache, dev, _) = cache_with_device(2, 16);

        // Bucket count is 6; lba 1 and lba 7 share a home bucket.
        let a = cache.read_lookup(TXN, dev, Lba(1)).unwrap();
        release(&cache, a);
        let b = cache.read_lookup(TXN, dev, Lba(7)).unwrap();
        release(&cache, b);

        // Evict the entry holding lba 1 (second-chance pass strips both
        // accessed flags first).
        let c = cache.read_lookup(TXN, dev, Lba(2)).unwrap();
        release(&cache, c);
        assert!(!cache.contains(dev, Lba(1)));

        // lba 7 was inserted past lba 1's bucket; its chain must survive.
        assert!(cache.contains(dev, Lba(7)));
        let again = cache.read_lookup(TXN, dev, Lba(7)).unwrap();
        release(&cache, again);
    }

    #[test]
    fn cache_exhaustion_is_an_error_not_a_hang() {
        let (cache, dev, _) = cache_with_device(1, 8);

        let _pinned = cache.read_lookup(TXN, dev, Lba(0)).unwrap();
        let err = cache.read_lookup(TXN, dev, Lba(1)).unwrap_err();
        assert!(matches!(err, Error::CacheExhausted));
    }

    #[test]
    fn allocate_then_bind_publishes_the_alias() {
        let (cache, dev, _) = cache_with_device(4, 8);

        let entry = cache.allocate(TXN).unwrap();
        cache.with_entry_mut(entry, |buf| buf[0] = 9);

        // Invisible until bound.
        assert!(!cache.contains(dev, Lba(2)));
        cache.set_lba(entry, dev, Lba(2)).unwrap();
        assert!(cache.contains(dev, Lba(2)));

        let mut owned = Vec::new();
        cache.release(entry, TXN, &mut owned).unwrap();
        assert_eq!(owned, vec![entry]);

        // Another transaction must not see the uncommitted sector.
        let err = cache.read_lookup(OTHER_TXN, dev, Lba(2)).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));

        // The owning transaction can re-read its own sector.
        let mine = cache.read_lookup(TXN, dev, Lba(2)).unwrap();
        assert_eq!(cache.with_entry(mine, |buf| buf[0]), 9);
        release(&cache, mine);

        cache.end_transaction(&owned);
        let theirs = cache.read_lookup(OTHER_TXN, dev, Lba(2)).unwrap();
        cache.release(theirs, OTHER_TXN, &mut Vec::new()).unwrap();
    }

    #[test]
    fn owned_entries_are_not_evicted_before_end_transaction() {
        let (cache, dev, _) = cache_with_device(1, 8);

        let entry = cache.allocate(TXN).unwrap();
        cache.set_lba(entry, dev, Lba(0)).unwrap();
        let mut owned = Vec::new();
        cache.release(entry, TXN, &mut owned).unwrap();

        // Unpinned but transaction-owned: the only slot stays off limits.
        let err = cache.read_lookup(TXN, dev, Lba(1)).unwrap_err();
        assert!(matches!(err, Error::CacheExhausted));

        cache.end_transaction(&owned);
        let loaded = cache.read_lookup(TXN, dev, Lba(1)).unwrap();
        release(&cache, loaded);
    }

    #[test]
    fn alias_slots_are_limited() {
        let (cache, dev, _) = cache_with_device(4, 16);

        let entry = cache.allocate(TXN).unwrap();
        for lba in 0..MAX_LOCATIONS as u64 {
            cache.set_lba(entry, dev, Lba(lba)).unwrap();
        }
        let err = cache.set_lba(entry, dev, Lba(9)).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));

        let mut owned = Vec::new();
        cache.release(entry, TXN, &mut owned).unwrap();
        cache.end_transaction(&owned);
    }

    #[test]
    fn leader_entries_are_never_victims() {
        let (cache, dev, _) = cache_with_device(2, 16);

        let a = cache.read_write_lookup(TXN, dev, Lba(0)).unwrap();
        release(&cache, a);
        cache.set_leader(a).unwrap();

        let b = cache.read_lookup(TXN, dev, Lba(1)).unwrap();
        release(&cache, b);

        let c = cache.read_lookup(TXN, dev, Lba(2)).unwrap();
        release(&cache, c);

        assert!(cache.contains(dev, Lba(0)));
        assert!(!cache.contains(dev, Lba(1)));
    }

    #[test]
    fn release_of_unpinned_entry_is_corruption() {
        let (cache, dev, _) = cache_with_device(2, 8);

        let entry = cache.read_lookup(TXN, dev, Lba(0)).unwrap();
        release(&cache, entry);

        let err = cache.release(entry, TXN, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }
}
