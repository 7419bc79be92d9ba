//! # Error Types
//!
//! The crate-wide error taxonomy. Every variant is matchable so callers can
//! distinguish expected outcomes (`KeyNotFound`, `Conflict`) from caller
//! mistakes (`DataTooBig`, `SizeNotAcceptable`) and hard failures
//! (`Corruption`, `OutOfSpace`).
//!
//! ## Propagation policy
//!
//! - `KeyNotFound`, `DataTooBig`, `SizeNotAcceptable`: ordinary result
//!   values; the caller decides what to do.
//! - `Conflict`: the transaction is over; retry from a fresh snapshot.
//! - `OutOfSpace`, `OutOfTransactions`, `CacheExhausted`: the operation
//!   stops; recoverable at a higher layer by freeing resources.
//! - `Corruption`: an on-disk invariant does not hold. Surfaced to the
//!   caller instead of aborting the process; the affected tree should be
//!   treated as unreadable.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Lookup or remove of a key that is not in the tree.
    #[error("key not found")]
    KeyNotFound,

    /// The destination value cannot hold the stored bytes.
    #[error("stored value is {actual} bytes but the destination holds at most {capacity}")]
    DataTooBig { actual: u16, capacity: u16 },

    /// The destination rejected the exact stored size.
    #[error("destination rejected value size {actual}")]
    SizeNotAcceptable { actual: u16 },

    /// The block address allocator reached the device capacity.
    #[error("device out of space")]
    OutOfSpace,

    /// Another transaction committed since this one's snapshot was taken.
    #[error("transaction conflict: published root changed since snapshot")]
    Conflict,

    /// The transaction pool is fully occupied.
    #[error("out of transactions")]
    OutOfTransactions,

    /// Every cache entry is pinned or transaction-owned; no eviction victim.
    #[error("block cache exhausted: no evictable entry")]
    CacheExhausted,

    /// An on-disk or in-memory invariant does not hold.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Sector I/O failed.
    #[error("device i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

/// Returns `Error::Corruption` with a formatted message unless `$cond` holds.
///
/// Malformed on-disk state is reported, never asserted on.
macro_rules! verify {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::Corruption(format!($($arg)+)));
        }
    };
}

pub(crate) use verify;
