//! # Core Identifier Types
//!
//! The two identifiers everything else is addressed by:
//!
//! - [`Key`]: the composite record identifier stored in tree nodes. Totally
//!   ordered lexicographically over `(kind, major, minor)`, which the derive
//!   order guarantees.
//! - [`Lba`]: a logical block address. Identity only; arithmetic stays inside
//!   the allocator.

/// Composite key identifying one record in a tree.
///
/// Keys are unique within a tree; inserting an existing key replaces its
/// value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    /// Record namespace; partitions the key space by record type.
    pub kind: u8,
    pub major: u64,
    pub minor: u64,
}

impl Key {
    pub const fn new(kind: u8, major: u64, minor: u64) -> Self {
        Self { kind, major, minor }
    }
}

/// Logical block address of one sector on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lba(pub u64);

impl std::fmt::Display for Lba {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lba:{}", self.0)
    }
}
