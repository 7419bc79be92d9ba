//! # Store
//!
//! The top of the stack: one device, one published tree root, one address
//! allocator, and a fixed pool of transaction slots. [`Store::begin`] hands
//! out snapshot transactions; [`Transaction::commit`](crate::Transaction)
//! swings the published root through [`Store::publish_root`].
//!
//! ## Address allocation
//!
//! Sector addresses are handed out monotonically and never reused: the
//! allocator is a single atomic counter that fails with `OutOfSpace` at the
//! device capacity. Superseded and abandoned sectors are unreachable
//! garbage; reclaiming them is outside this crate's scope.
//!
//! ## Opening
//!
//! There is no on-device superblock. [`Store::format`] bootstraps a fresh
//! device with an empty leaf root at address 0; [`Store::open`] attaches to
//! a device whose root address and allocation watermark the caller tracked
//! elsewhere.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::btree::node::LeafBuilder;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::storage::{BlockCache, BlockDevice, DeviceId};
use crate::txn::Transaction;
use crate::types::Lba;

/// Monotonic sector address allocator. Addresses are never reused.
#[derive(Debug)]
pub(crate) struct LbaAllocator {
    next: AtomicU64,
    capacity: u64,
}

impl LbaAllocator {
    fn new(next: u64, capacity: u64) -> Self {
        Self {
            next: AtomicU64::new(next),
            capacity,
        }
    }

    pub(crate) fn next(&self) -> Result<Lba> {
        let lba = self.next.fetch_add(1, Ordering::Relaxed);
        if lba >= self.capacity {
            return Err(Error::OutOfSpace);
        }
        Ok(Lba(lba))
    }

    fn watermark(&self) -> u64 {
        self.next.load(Ordering::Relaxed).min(self.capacity)
    }
}

/// One tree on one device, with its published root and transaction pool.
#[derive(Debug)]
pub struct Store {
    cache: Arc<BlockCache>,
    device: DeviceId,
    alloc: LbaAllocator,
    root: Mutex<Lba>,
    slots: Mutex<Vec<bool>>,
    next_txn: AtomicU64,
}

impl Store {
    /// Bootstrap a fresh device: write an empty leaf root at address 0 and
    /// publish it.
    pub fn format(
        cache: Arc<BlockCache>,
        device: Arc<dyn BlockDevice>,
        config: &Config,
    ) -> Result<Store> {
        let capacity = device.size_in_sectors();
        let device_id = cache.register_device(device);
        let alloc = LbaAllocator::new(0, capacity);

        // Bootstrap under a throwaway transaction identity; the entry is
        // released and unmarked before the store exists.
        let mut owned = Vec::new();
        let entry = cache.allocate(0)?;
        cache.with_entry_mut(entry, |buf| LeafBuilder::new(buf, true).finish());
        let sealed = alloc
            .next()
            .and_then(|root| cache.set_lba(entry, device_id, root).map(|_| root));
        if sealed.is_err() {
            // A zero-capacity device must not strand the pinned entry.
            let _ = cache.release(entry, 0, &mut owned);
            cache.end_transaction(&owned);
        }
        let root = sealed?;
        cache.release(entry, 0, &mut owned)?;
        cache.end_transaction(&owned);

        debug!(%root, capacity, "store formatted");
        Ok(Self::assemble(cache, device_id, alloc, root, config))
    }

    /// Attach to an already formatted device. The caller supplies the root
    /// address and the first never-allocated address.
    pub fn open(
        cache: Arc<BlockCache>,
        device: Arc<dyn BlockDevice>,
        config: &Config,
        root: Lba,
        next_free: u64,
    ) -> Result<Store> {
        let capacity = device.size_in_sectors();
        if root.0 >= capacity || next_free > capacity || root.0 >= next_free {
            return Err(Error::corruption(format!(
                "open with root {root} and watermark {next_free} on a {capacity}-sector device"
            )));
        }
        let device_id = cache.register_device(device);
        let alloc = LbaAllocator::new(next_free, capacity);
        debug!(%root, next_free, "store opened");
        Ok(Self::assemble(cache, device_id, alloc, root, config))
    }

    fn assemble(
        cache: Arc<BlockCache>,
        device: DeviceId,
        alloc: LbaAllocator,
        root: Lba,
        config: &Config,
    ) -> Store {
        Store {
            cache,
            device,
            alloc,
            root: Mutex::new(root),
            slots: Mutex::new(vec![false; config.max_transactions.max(1)]),
            next_txn: AtomicU64::new(0),
        }
    }

    /// Begin a transaction on the currently published root. Fails with
    /// `OutOfTransactions` when every pool slot is active.
    pub fn begin(&self) -> Result<Transaction<'_>> {
        let slot = {
            let mut slots = self.slots.lock();
            match slots.iter().position(|occupied| !occupied) {
                Some(slot) => {
                    slots[slot] = true;
                    slot
                }
                None => return Err(Error::OutOfTransactions),
            }
        };
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed) + 1;
        let root = *self.root.lock();
        debug!(txn = id, %root, "transaction begun");
        Ok(Transaction::new(self, slot, id, root))
    }

    /// Currently published root address.
    pub fn published_root(&self) -> Lba {
        *self.root.lock()
    }

    /// Sector addresses handed out so far (including the root written by
    /// `format`).
    pub fn sectors_allocated(&self) -> u64 {
        self.alloc.watermark()
    }

    pub(crate) fn publish_root(&self, txn: u64, snapshot: Lba, new_root: Lba) -> Result<()> {
        let mut root = self.root.lock();
        if *root != snapshot {
            debug!(txn, snapshot = %snapshot, published = %*root, "commit conflict");
            return Err(Error::Conflict);
        }
        *root = new_root;
        debug!(txn, %new_root, "root published");
        Ok(())
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        self.slots.lock()[slot] = false;
    }

    pub(crate) fn cache(&self) -> &BlockCache {
        &self.cache
    }

    pub(crate) fn allocator(&self) -> &LbaAllocator {
        &self.alloc
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.device
    }
}
