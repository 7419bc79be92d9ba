//! # sectordb
//!
//! An embedded, transactional key/value store for fixed-size block devices.
//! Values live in a copy-on-write B+tree of 4096-byte sector nodes; all
//! device traffic flows through a fixed-capacity block cache with CLOCK
//! eviction; concurrency is snapshot isolation with optimistic,
//! first-committer-wins root publication.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Store                                        │
//! │   published root · address allocator ·       │
//! │   transaction pool                           │
//! ├──────────────────────────────────────────────┤
//! │ Transaction                                  │
//! │   snapshot root · private root ·             │
//! │   owned cache entries                        │
//! ├──────────────────────────────────────────────┤
//! │ BPlusTree                                    │
//! │   copy-on-write descent · replay · split     │
//! ├──────────────────────────────────────────────┤
//! │ BlockCache                                   │
//! │   pinned sector pool · open-addressing hash  │
//! │   table · CLOCK eviction · write-back        │
//! ├──────────────────────────────────────────────┤
//! │ BlockDevice                                  │
//! │   whole-sector reads and writes              │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Published sectors are immutable: a mutation rebuilds the root-to-leaf
//! path into freshly allocated sectors and commit makes the new root
//! visible in one root swap. Readers on older roots are never blocked and
//! never see partial updates; the only write/write coordination is the
//! conflict check at commit.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sectordb::{BlockCache, Config, Key, MemDevice, RawData, Store};
//!
//! fn main() -> sectordb::Result<()> {
//!     let config = Config::default();
//!     let cache = BlockCache::new(config.cache_entries);
//!     let store = Store::format(cache, Arc::new(MemDevice::new(1024)), &config)?;
//!
//!     let mut payload = b"hello".to_vec();
//!     let mut txn = store.begin()?;
//!     txn.insert(Key::new(0, 42, 0), &RawData::new(&mut payload))?;
//!     txn.commit()?;
//!
//!     let mut buf = [0u8; 16];
//!     let mut value = RawData::new(&mut buf);
//!     let mut txn = store.begin()?;
//!     let size = txn.get(Key::new(0, 42, 0), &mut value)?;
//!     assert_eq!(&buf[..size as usize], b"hello");
//!     Ok(())
//! }
//! ```
//!
//! ## Scope
//!
//! Superseded sectors are never reclaimed, there is no on-device
//! superblock, and crash recovery is the caller's problem: this crate is
//! the storage engine, not the filesystem around it.

pub mod btree;
pub mod config;
pub mod error;
pub mod storage;
pub mod store;
pub mod txn;
pub mod types;
pub mod value;

pub use btree::MAX_INLINE_VALUE;
pub use config::{Config, SECTOR_SIZE};
pub use error::{Error, Result};
pub use storage::{BlockCache, BlockDevice, FileDevice, MemDevice};
pub use store::Store;
pub use txn::{Transaction, TxnId};
pub use types::{Key, Lba};
pub use value::{Counter, RawData, Serializable};
