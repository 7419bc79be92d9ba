//! # Copy-on-Write B+Tree
//!
//! A [`BPlusTree`] is nothing but `(device, root address)`. Lookup descends
//! from the root; insert and remove rebuild every node on the descent path
//! into freshly allocated sectors and hand back a *new* tree value pointing
//! at the new root. Published sectors are never touched, so any number of
//! readers can keep descending an old root while a writer builds the next
//! one.
//!
//! ## Mutation
//!
//! `update` recurses to the leaf owning the key, replays the leaf's records
//! into up to three fresh siblings (splitting greedily at half the projected
//! size when the result would not fit one sector), and returns the siblings
//! as child descriptors. Each internal level then *weaves*: it replays its
//! own child slots with the descended slot replaced by the returned
//! descriptors, again splitting into up to three siblings when needed. A
//! level that ends up with a single child promotes that child instead of
//! wrapping it, which is how the tree shrinks. The root of the recursion
//! turns the final descriptors into the new root:
//!
//! ```text
//! 1 descriptor   that sector is the new root
//! 2-3            a fresh internal root is written above them
//! 0              a fresh empty leaf becomes the root (last key removed)
//! ```
//!
//! Remove never splits; it replays with a full-sector target, so a removal
//! yields exactly one sibling (or none, when the last record goes).
//!
//! ## Allocation discipline
//!
//! Remove of an absent key fails with `KeyNotFound` before any sector is
//! allocated. Every sector allocated here stays private to the transaction
//! until its root is published; a conflicting transaction simply never
//! publishes, and its sectors are unreachable garbage.

use bumpalo::Bump;
use smallvec::SmallVec;
use tracing::trace;

use crate::config::SECTOR_SIZE;
use crate::error::{verify, Error, Result};
use crate::storage::DeviceId;
use crate::txn::TxnCtx;
use crate::types::{Key, Lba};
use crate::value::Serializable;

use super::node::{
    encode_overflow_ref, InternalBuilder, LeafBuilder, NodeView, CHILD_PTR_SIZE,
    INTERNAL_RECORD_SIZE, LEAF_RECORD_SIZE, MAX_INLINE_VALUE, OVERFLOW_REF_SIZE,
};

/// One rebuilt child handed up the descent path: its sector address and its
/// minimum key, used as the separator in the parent. `None` marks the
/// keyless first child of an internal node, whose lower bound is unknown.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChildDescriptor {
    key: Option<Key>,
    lba: Lba,
}

type Children = SmallVec<[ChildDescriptor; 3]>;

/// An immutable tree: a device and a root sector address.
#[derive(Debug, Clone, Copy)]
pub struct BPlusTree {
    device: DeviceId,
    root: Lba,
}

/// Outcome of decoding one node during a lookup descent.
enum Step {
    Descend(Lba),
    Done(u16),
    Overflow { lba: Lba, size: u16, is_little: bool },
    Missing,
}

impl BPlusTree {
    pub(crate) fn new(device: DeviceId, root: Lba) -> Self {
        Self { device, root }
    }

    pub fn root(&self) -> Lba {
        self.root
    }

    /// Find `key` and decode its value into `dest`. Returns the stored size.
    pub(crate) fn get(
        &self,
        ctx: &mut TxnCtx<'_>,
        key: Key,
        dest: &mut dyn Serializable,
    ) -> Result<u16> {
        let mut lba = self.root;
        loop {
            let entry = ctx.read(lba)?;
            let step = ctx.with_entry(entry, |buf| -> Result<Step> {
                let node = NodeView::parse(buf)?;
                let (found, idx) = node.search(key)?;

                if node.is_leaf() {
                    if !found {
                        return Ok(Step::Missing);
                    }
                    let rec = node.leaf_record(idx - 1)?;
                    if rec.is_overflow {
                        let (overflow_lba, size) = node.overflow_ref(rec.offset)?;
                        return Ok(Step::Overflow {
                            lba: overflow_lba,
                            size,
                            is_little: node.is_little(),
                        });
                    }
                    check_destination(dest, rec.size)?;
                    dest.decode(node.value_span(&rec)?, rec.size, node.is_little())?;
                    Ok(Step::Done(rec.size))
                } else {
                    let offset = if idx == 0 {
                        node.first_child_offset()?
                    } else {
                        node.internal_record(idx - 1)?.offset
                    };
                    Ok(Step::Descend(node.child_lba(offset)?))
                }
            });
            ctx.release(entry)?;

            match step? {
                Step::Descend(child) => lba = child,
                Step::Done(size) => return Ok(size),
                Step::Missing => return Err(Error::KeyNotFound),
                Step::Overflow { lba, size, is_little } => {
                    check_destination(dest, size)?;
                    let overflow = ctx.read(lba)?;
                    let decoded = ctx.with_entry(overflow, |buf| {
                        dest.decode(&buf[..size as usize], size, is_little)
                    });
                    ctx.release(overflow)?;
                    decoded?;
                    return Ok(size);
                }
            }
        }
    }

    /// Insert `key` (replacing any existing value) and return the tree
    /// rooted at the rebuilt path.
    pub(crate) fn insert(
        &self,
        ctx: &mut TxnCtx<'_>,
        key: Key,
        value: &dyn Serializable,
    ) -> Result<BPlusTree> {
        if value.size_in_bytes() as usize >= SECTOR_SIZE {
            return Err(Error::DataTooBig {
                actual: value.size_in_bytes(),
                capacity: (SECTOR_SIZE - 1) as u16,
            });
        }
        self.mutate(ctx, key, Some(value))
    }

    /// Remove `key` and return the tree rooted at the rebuilt path. Fails
    /// with `KeyNotFound` before allocating anything when the key is absent.
    pub(crate) fn remove(&self, ctx: &mut TxnCtx<'_>, key: Key) -> Result<BPlusTree> {
        self.mutate(ctx, key, None)
    }

    fn mutate(
        &self,
        ctx: &mut TxnCtx<'_>,
        key: Key,
        op: Option<&dyn Serializable>,
    ) -> Result<BPlusTree> {
        let arena = Bump::new();
        let is_little = self.root_is_little(ctx)?;
        let children = self.update(ctx, &arena, self.root, key, op)?;
        let root = self.rebuild_root(ctx, children, is_little)?;
        trace!(old = %self.root, new = %root, "tree path rebuilt");
        Ok(BPlusTree {
            device: self.device,
            root,
        })
    }

    fn root_is_little(&self, ctx: &mut TxnCtx<'_>) -> Result<bool> {
        let entry = ctx.read(self.root)?;
        let parsed = ctx.with_entry(entry, |buf| NodeView::parse(buf).map(|n| n.is_little()));
        ctx.release(entry)?;
        parsed
    }

    /// Rebuild the path below `lba` for `op` on `key`, returning the fresh
    /// siblings that replace this node in its parent.
    fn update<'b>(
        &self,
        ctx: &mut TxnCtx<'_>,
        arena: &'b Bump,
        lba: Lba,
        key: Key,
        op: Option<&dyn Serializable>,
    ) -> Result<Children> {
        // Snapshot the node so the pin can be dropped before this level
        // allocates; published sectors cannot change under us.
        let entry = ctx.read(lba)?;
        let snapshot: &'b [u8] = ctx.with_entry(entry, |buf| &*arena.alloc_slice_copy(buf));
        ctx.release(entry)?;

        let node = NodeView::parse(snapshot)?;
        let (found, idx) = node.search(key)?;

        if node.is_leaf() {
            return self.update_leaf(ctx, arena, &node, found, idx, key, op);
        }

        let offset = if idx == 0 {
            node.first_child_offset()?
        } else {
            node.internal_record(idx - 1)?.offset
        };
        let child = node.child_lba(offset)?;

        let rebuilt = self.update(ctx, arena, child, key, op)?;
        self.weave(ctx, &node, idx, rebuilt)
    }

    /// Replay a leaf's records with the operation applied, packing them into
    /// up to three fresh sibling leaves.
    #[allow(clippy::too_many_arguments)]
    fn update_leaf(
        &self,
        ctx: &mut TxnCtx<'_>,
        arena: &Bump,
        node: &NodeView<'_>,
        found: bool,
        idx: usize,
        key: Key,
        op: Option<&dyn Serializable>,
    ) -> Result<Children> {
        if op.is_none() && !found {
            return Err(Error::KeyNotFound);
        }

        let is_little = node.is_little();
        let existing = if found {
            node.leaf_record(idx - 1)?.size as usize + LEAF_RECORD_SIZE
        } else {
            0
        };

        // Encode the new payload up front; values too large for a node go
        // to a dedicated overflow sector and the payload becomes a
        // reference.
        let mut new_payload: &[u8] = &[];
        let mut new_is_overflow = false;
        if let Some(value) = op {
            let size = value.size_in_bytes() as usize;
            if size > MAX_INLINE_VALUE {
                let overflow = ctx.allocate()?;
                let encoded =
                    ctx.with_entry_mut(overflow, |buf| value.encode(&mut buf[..size], is_little));
                if encoded.is_err() {
                    let _ = ctx.release(overflow);
                }
                encoded?;
                let overflow_lba = ctx.seal(overflow)?;

                let payload = arena.alloc_slice_fill_copy(OVERFLOW_REF_SIZE, 0u8);
                encode_overflow_ref(payload, overflow_lba, size as u16, is_little);
                new_payload = payload;
                new_is_overflow = true;
                trace!(%overflow_lba, size, "value spilled to overflow sector");
            } else {
                let payload = arena.alloc_slice_fill_copy(size, 0u8);
                value.encode(payload, is_little)?;
                new_payload = payload;
            }
        }

        // Split only on insert, and only when the projected node would not
        // fit one sector; the target is then half the projected size.
        let mut target = SECTOR_SIZE;
        if op.is_some() {
            let projected =
                node.used_space() + LEAF_RECORD_SIZE + new_payload.len() - existing;
            if projected >= SECTOR_SIZE {
                target = projected / 2;
            }
        }

        // The merged record stream: old records with the operation spliced
        // in at the search position.
        #[derive(Clone, Copy)]
        enum Item {
            Old(usize),
            New,
        }
        let mut items: Vec<Item> = (0..node.key_count()).map(Item::Old).collect();
        match (op.is_some(), found) {
            (true, true) => items[idx - 1] = Item::New,
            (true, false) => items.insert(idx, Item::New),
            (false, true) => {
                items.remove(idx - 1);
            }
            (false, false) => unreachable!("absent key is rejected above"),
        }

        let mut out = Children::new();
        let mut i = 0;
        while i < items.len() {
            verify!(
                out.len() < 3,
                "leaf replay produced more than three siblings"
            );

            let entry = ctx.allocate()?;
            let packed = ctx.with_entry_mut(entry, |buf| -> Result<Option<Key>> {
                let mut builder = LeafBuilder::new(buf, is_little);
                while i < items.len() {
                    if builder.record_count() > 0 && builder.used_space() >= target {
                        break;
                    }
                    let (item_key, item_overflow, payload) = match items[i] {
                        Item::Old(j) => {
                            let rec = node.leaf_record(j)?;
                            (rec.key, rec.is_overflow, node.value_span(&rec)?)
                        }
                        Item::New => (key, new_is_overflow, new_payload),
                    };
                    if !builder.fits(payload.len()) {
                        break;
                    }
                    builder.push(item_key, item_overflow, payload)?;
                    i += 1;
                }
                let first_key = builder.first_key();
                builder.finish();
                Ok(first_key)
            });
            if packed.is_err() {
                let _ = ctx.release(entry);
            }
            let first_key = packed?;

            let sibling_lba = ctx.seal(entry)?;
            out.push(ChildDescriptor {
                key: first_key,
                lba: sibling_lba,
            });
        }

        Ok(out)
    }

    /// Replay an internal node's child slots with the descended slot
    /// replaced by `rebuilt`, packing the result into up to three fresh
    /// siblings. A sibling that would hold a single child is promoted.
    fn weave(
        &self,
        ctx: &mut TxnCtx<'_>,
        node: &NodeView<'_>,
        idx: usize,
        rebuilt: Children,
    ) -> Result<Children> {
        let is_little = node.is_little();
        let slots = node.key_count() + 1;

        let old_slot = |slot: usize| -> Result<(Option<Key>, Lba)> {
            if slot == 0 {
                let offset = node.first_child_offset()?;
                Ok((None, node.child_lba(offset)?))
            } else {
                let rec = node.internal_record(slot - 1)?;
                Ok((Some(rec.key), node.child_lba(rec.offset)?))
            }
        };

        let mut items: Vec<(Option<Key>, Lba)> = Vec::with_capacity(slots + 2);
        for slot in 0..slots {
            if slot != idx {
                items.push(old_slot(slot)?);
                continue;
            }
            for (j, child) in rebuilt.iter().enumerate() {
                let separator = if j == 0 {
                    // The subtree's lower bound did not move; keep the old
                    // separator (or the keyless slot).
                    old_slot(slot)?.0
                } else {
                    Some(child.key.ok_or_else(|| {
                        Error::corruption("split sibling carries no separator key")
                    })?)
                };
                items.push((separator, child.lba));
            }
        }

        // Internal split targets are measured in payload (child pointer)
        // bytes.
        let mut target = SECTOR_SIZE;
        let extra =
            rebuilt.len().saturating_sub(1) * (INTERNAL_RECORD_SIZE + CHILD_PTR_SIZE);
        if !rebuilt.is_empty() && node.used_space() + extra > SECTOR_SIZE {
            target = (node.payload_bytes() + extra) / 2;
        }

        let mut out = Children::new();
        let mut i = 0;
        while i < items.len() {
            verify!(
                out.len() < 3,
                "internal replay produced more than three siblings"
            );

            // A node reduced to one child is promoted rather than wrapped,
            // which is how the tree shrinks. A lone child left over after a
            // split is written as a single-child node instead, keeping all
            // leaves at the same depth.
            if i + 1 == items.len() && out.is_empty() {
                let (promoted_key, promoted_lba) = items[i];
                out.push(ChildDescriptor {
                    key: promoted_key,
                    lba: promoted_lba,
                });
                break;
            }

            let group_start = i;
            let entry = ctx.allocate()?;
            let packed = ctx.with_entry_mut(entry, |buf| -> Result<()> {
                let mut builder = InternalBuilder::new(buf, is_little);
                while i < items.len() {
                    if builder.child_count() > 0 && builder.payload_bytes() >= target {
                        break;
                    }
                    if !builder.fits_child() {
                        break;
                    }
                    let (separator, child_lba) = items[i];
                    // Within a sibling only the first child is keyless.
                    let separator = if builder.child_count() == 0 {
                        None
                    } else {
                        separator
                    };
                    builder.push_child(separator, child_lba)?;
                    i += 1;
                }
                builder.finish()
            });
            if packed.is_err() {
                let _ = ctx.release(entry);
            }
            packed?;

            let group_key = items[group_start].0;
            let sibling_lba = ctx.seal(entry)?;
            out.push(ChildDescriptor {
                key: group_key,
                lba: sibling_lba,
            });
        }

        Ok(out)
    }

    /// Turn the final descriptors of a mutation into the new root address.
    fn rebuild_root(
        &self,
        ctx: &mut TxnCtx<'_>,
        children: Children,
        is_little: bool,
    ) -> Result<Lba> {
        match children.len() {
            1 => Ok(children[0].lba),
            0 => {
                // The last record is gone; the tree restarts as one empty
                // leaf so lookups keep terminating at a leaf.
                let entry = ctx.allocate()?;
                ctx.with_entry_mut(entry, |buf| LeafBuilder::new(buf, is_little).finish());
                Ok(ctx.seal(entry)?)
            }
            n => {
                verify!(n <= 3, "root rebuild with {n} children");
                let entry = ctx.allocate()?;
                let packed = ctx.with_entry_mut(entry, |buf| -> Result<()> {
                    let mut builder = InternalBuilder::new(buf, is_little);
                    builder.push_child(None, children[0].lba)?;
                    for child in &children[1..] {
                        let separator = child.key.ok_or_else(|| {
                            Error::corruption("root sibling carries no separator key")
                        })?;
                        builder.push_child(Some(separator), child.lba)?;
                    }
                    builder.finish()
                });
                if packed.is_err() {
                    let _ = ctx.release(entry);
                }
                packed?;
                Ok(ctx.seal(entry)?)
            }
        }
    }
}

fn check_destination(dest: &dyn Serializable, size: u16) -> Result<()> {
    if dest.size_in_bytes() < size {
        return Err(Error::DataTooBig {
            actual: size,
            capacity: dest.size_in_bytes(),
        });
    }
    if !dest.is_size_acceptable(size) {
        return Err(Error::SizeNotAcceptable { actual: size });
    }
    Ok(())
}
