//! # Storage Module
//!
//! The device and caching layer everything above descends through.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  BPlusTree / Transaction (callers)  │
//! ├─────────────────────────────────────┤
//! │  BlockCache                         │
//! │    fixed CacheEntry pool            │
//! │    open-addressing hash table       │
//! │    CLOCK eviction + write-back      │
//! ├─────────────────────────────────────┤
//! │  BlockDevice (trait)                │
//! │    FileDevice │ MemDevice │ ...     │
//! └─────────────────────────────────────┘
//! ```
//!
//! All I/O is whole-sector: a device reads or writes exactly
//! [`SECTOR_SIZE`](crate::config::SECTOR_SIZE) bytes at a logical block
//! address, nothing else. The cache is the only component that calls a
//! device; tree code sees pinned sector buffers.
//!
//! ## Module Organization
//!
//! - [`device`]: the whole-sector I/O contract and its file/memory backends
//! - [`cache`]: the process-wide pinned sector cache

pub mod cache;
pub mod device;

pub use cache::{BlockCache, DeviceId, EntryId};
pub use device::{BlockDevice, FileDevice, MemDevice};
