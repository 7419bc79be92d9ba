//! # Configuration Constants
//!
//! Centralized configuration for sectordb. Everything below derives from
//! `SECTOR_SIZE`; the node-format constants themselves live next to the
//! codec in [`crate::btree::node`].
//!
//! ```text
//! SECTOR_SIZE (4096 bytes)
//!       │
//!       ├─> NODE_HEADER_SIZE (4 bytes, fixed)
//!       │
//!       ├─> USED_SIZE_MASK (SECTOR_SIZE - 1; low bits of the header's
//!       │     used-size-and-flags word)
//!       │
//!       └─> MAX_INLINE_VALUE (derived: one sector minus node header minus
//!             one leaf key record; larger values go to overflow sectors)
//!
//! DEFAULT_CACHE_ENTRIES (1024)
//!       │
//!       └─> hash table gets MAX_LOCATIONS * entries buckets, so the load
//!           factor stays below 1/3 even with every alias slot bound
//! ```
//!
//! ## Invariants
//!
//! 1. `SECTOR_SIZE` is a power of two (the used-size mask depends on it)
//! 2. `USED_SIZE_MASK` must not overlap `LEAF_FLAG` (0x8000)
//! 3. `MAX_LOCATIONS` is fixed at 3 by the on-disk compatibility contract

/// Fixed unit of storage and caching. One B+tree node per sector.
pub const SECTOR_SIZE: usize = 4096;

/// Maximum number of (device, address) aliases a cache entry can carry.
pub const MAX_LOCATIONS: usize = 3;

/// Default number of slots in the block cache pool.
pub const DEFAULT_CACHE_ENTRIES: usize = 1024;

/// Default size of the transaction pool.
pub const DEFAULT_MAX_TRANSACTIONS: usize = 16;

const _: () = assert!(SECTOR_SIZE.is_power_of_two());
const _: () = assert!(SECTOR_SIZE - 1 < 0x8000, "used-size bits overlap the leaf flag");

/// Tunables for a [`crate::BlockCache`] / [`crate::Store`] pair.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Number of cache entries in the shared pool.
    pub cache_entries: usize,
    /// Number of transactions that may be active at once.
    pub max_transactions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_entries: DEFAULT_CACHE_ENTRIES,
            max_transactions: DEFAULT_MAX_TRANSACTIONS,
        }
    }
}

impl Config {
    pub fn with_cache_entries(mut self, entries: usize) -> Self {
        self.cache_entries = entries;
        self
    }

    pub fn with_max_transactions(mut self, max: usize) -> Self {
        self.max_transactions = max;
        self
    }
}
