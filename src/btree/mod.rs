//! # B+Tree Module
//!
//! The ordered key/value structure stored on sector devices.
//!
//! ## Module Organization
//!
//! - [`node`]: the on-sector node format, its decoder and its builders
//! - [`tree`]: copy-on-write descent, replay, split and root rebuild
//!
//! A tree value is immutable: mutations return a new [`BPlusTree`] whose
//! root must be published by a committing transaction before other
//! snapshots can see it.

pub mod node;
pub mod tree;

pub use node::MAX_INLINE_VALUE;
pub use tree::BPlusTree;
