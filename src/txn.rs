//! # Transactions
//!
//! Every tree access runs inside a [`Transaction`]. The transaction captures
//! the published root when it begins and reads from that snapshot for its
//! whole life; mutations rebuild copy-on-write paths and move the
//! transaction's *private* root forward, so it reads its own writes while
//! concurrent snapshots see nothing.
//!
//! ## Commit
//!
//! Commit is optimistic. A transaction that never moved its root commits
//! trivially. A writer compares the published root against its snapshot
//! under the store's root lock:
//!
//! ```text
//! published == snapshot   swing published to the private root
//! published != snapshot   Error::Conflict; nothing is published
//! ```
//!
//! First committer wins. A conflicting (or dropped) transaction releases
//! its cache entries and its pool slot; the sectors it allocated are never
//! referenced by any published root and are simply unreachable. The caller
//! retries by beginning a fresh transaction.
//!
//! Dropping a transaction without committing aborts it.

use tracing::debug;

use crate::btree::BPlusTree;
use crate::error::Result;
use crate::storage::{BlockCache, DeviceId, EntryId};
use crate::store::{LbaAllocator, Store};
use crate::types::{Key, Lba};
use crate::value::Serializable;

/// Identity of one transaction, unique for the store's lifetime.
pub type TxnId = u64;

/// Everything a tree operation needs from its transaction: the cache, the
/// address allocator, and the list linking freshly allocated entries to the
/// transaction.
pub(crate) struct TxnCtx<'a> {
    cache: &'a BlockCache,
    alloc: &'a LbaAllocator,
    device: DeviceId,
    txn_id: TxnId,
    owned: &'a mut Vec<EntryId>,
}

impl TxnCtx<'_> {
    /// Pin `lba` for reading.
    pub(crate) fn read(&self, lba: Lba) -> Result<EntryId> {
        self.cache.read_lookup(self.txn_id, self.device, lba)
    }

    /// Stage a fresh, addressless sector.
    pub(crate) fn allocate(&self) -> Result<EntryId> {
        self.cache.allocate(self.txn_id)
    }

    /// Assign the next free address to a staged sector and drop the pin.
    /// The entry is released even when allocation fails, so no pin outlives
    /// an `OutOfSpace` error.
    pub(crate) fn seal(&mut self, entry: EntryId) -> Result<Lba> {
        let bound = self.alloc.next().and_then(|lba| {
            self.cache.set_lba(entry, self.device, lba)?;
            Ok(lba)
        });
        match bound {
            Ok(lba) => {
                self.release(entry)?;
                Ok(lba)
            }
            Err(err) => {
                let _ = self.release(entry);
                Err(err)
            }
        }
    }

    /// Drop one pin, linking freshly allocated entries to this transaction.
    pub(crate) fn release(&mut self, entry: EntryId) -> Result<()> {
        self.cache.release(entry, self.txn_id, self.owned)
    }

    pub(crate) fn with_entry<R>(&self, entry: EntryId, f: impl FnOnce(&[u8]) -> R) -> R {
        self.cache.with_entry(entry, f)
    }

    pub(crate) fn with_entry_mut<R>(&self, entry: EntryId, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.cache.with_entry_mut(entry, f)
    }
}

/// A snapshot-isolated view of one store's tree.
///
/// Obtained from [`Store::begin`](crate::Store::begin); committed with
/// [`commit`](Self::commit) or aborted by dropping it.
pub struct Transaction<'s> {
    store: &'s Store,
    id: TxnId,
    slot: usize,
    snapshot_root: Lba,
    current: BPlusTree,
    owned: Vec<EntryId>,
    finished: bool,
}

impl<'s> Transaction<'s> {
    pub(crate) fn new(store: &'s Store, slot: usize, id: TxnId, root: Lba) -> Self {
        Self {
            store,
            id,
            slot,
            snapshot_root: root,
            current: BPlusTree::new(store.device_id(), root),
            owned: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Root of this transaction's current view (the snapshot root until the
    /// first mutation).
    pub fn root(&self) -> Lba {
        self.current.root()
    }

    /// Look up `key`, decoding its value into `dest`. Returns the stored
    /// size in bytes.
    pub fn get(&mut self, key: Key, dest: &mut dyn Serializable) -> Result<u16> {
        let tree = self.current;
        let mut ctx = self.ctx();
        tree.get(&mut ctx, key, dest)
    }

    /// Insert `key`, replacing any existing value.
    pub fn insert(&mut self, key: Key, value: &dyn Serializable) -> Result<()> {
        let tree = self.current;
        let mut ctx = self.ctx();
        let updated = tree.insert(&mut ctx, key, value)?;
        self.current = updated;
        Ok(())
    }

    /// Remove `key`. Fails with `KeyNotFound` (allocating nothing) when the
    /// key is absent.
    pub fn remove(&mut self, key: Key) -> Result<()> {
        let tree = self.current;
        let mut ctx = self.ctx();
        let updated = tree.remove(&mut ctx, key)?;
        self.current = updated;
        Ok(())
    }

    /// Publish this transaction's root, or fail with `Conflict` if another
    /// transaction committed first. Read-only transactions never conflict.
    /// Either way the transaction is over.
    pub fn commit(mut self) -> Result<()> {
        let result = if self.current.root() == self.snapshot_root {
            debug!(txn = self.id, "read-only commit");
            Ok(())
        } else {
            self.store
                .publish_root(self.id, self.snapshot_root, self.current.root())
        };
        self.finish();
        result
    }

    /// Abort explicitly. Equivalent to dropping the transaction.
    pub fn rollback(self) {}

    fn ctx(&mut self) -> TxnCtx<'_> {
        TxnCtx {
            cache: self.store.cache(),
            alloc: self.store.allocator(),
            device: self.store.device_id(),
            txn_id: self.id,
            owned: &mut self.owned,
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.store.cache().end_transaction(&self.owned);
        self.store.release_slot(self.slot);
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
