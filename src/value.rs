//! # Value Serialization Contract
//!
//! Anything stored under a [`Key`](crate::Key) goes through [`Serializable`]:
//! the tree asks the value for its encoded size up front, encodes it straight
//! into a node (or overflow) sector, and decodes it back into a
//! caller-provided destination on lookup.
//!
//! The `is_little` flag carried through `encode`/`decode` is the node's
//! payload endianness, taken from the top bit of the node's format version
//! byte. Raw byte spans ignore it; typed records must honor it.
//!
//! Two implementations ship with the crate:
//!
//! - [`RawData`]: an uninterpreted byte span over a borrowed buffer. Accepts
//!   any stored size up to its capacity.
//! - [`Counter`]: a u64 record that demands its exact encoded size, the
//!   pattern for fixed-layout metadata records.

use crate::error::{Error, Result};

/// Encode/decode contract for stored values.
pub trait Serializable {
    /// Encoded size in bytes (capacity of the destination on lookup).
    fn size_in_bytes(&self) -> u16;

    /// Whether a stored value of `candidate` bytes may be decoded into this
    /// destination. The default accepts anything that fits.
    fn is_size_acceptable(&self, candidate: u16) -> bool {
        candidate <= self.size_in_bytes()
    }

    /// Write exactly `size_in_bytes()` bytes into `buf`.
    fn encode(&self, buf: &mut [u8], is_little: bool) -> Result<()>;

    /// Read `size` bytes from `buf` into self.
    fn decode(&mut self, buf: &[u8], size: u16, is_little: bool) -> Result<()>;
}

/// An uninterpreted byte span over a borrowed buffer.
///
/// On insert the whole buffer is stored; on lookup `len()` reports how many
/// bytes the stored value actually occupied.
#[derive(Debug)]
pub struct RawData<'a> {
    bytes: &'a mut [u8],
    len: u16,
}

impl<'a> RawData<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        let len = bytes.len() as u16;
        Self { bytes, len }
    }

    /// Bytes occupied by the most recently decoded value.
    pub fn len(&self) -> u16 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl Serializable for RawData<'_> {
    fn size_in_bytes(&self) -> u16 {
        self.bytes.len() as u16
    }

    fn encode(&self, buf: &mut [u8], _is_little: bool) -> Result<()> {
        buf[..self.bytes.len()].copy_from_slice(self.bytes);
        Ok(())
    }

    fn decode(&mut self, buf: &[u8], size: u16, _is_little: bool) -> Result<()> {
        let size = size as usize;
        if size > self.bytes.len() {
            return Err(Error::DataTooBig {
                actual: size as u16,
                capacity: self.bytes.len() as u16,
            });
        }
        self.bytes[..size].copy_from_slice(&buf[..size]);
        self.len = size as u16;
        Ok(())
    }
}

/// A u64 record with a fixed 8-byte encoding.
///
/// Rejects any stored size other than exactly 8 bytes, so a lookup into a
/// `Counter` fails with `SizeNotAcceptable` when the key holds something
/// else.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counter(pub u64);

impl Serializable for Counter {
    fn size_in_bytes(&self) -> u16 {
        8
    }

    fn is_size_acceptable(&self, candidate: u16) -> bool {
        candidate == 8
    }

    fn encode(&self, buf: &mut [u8], is_little: bool) -> Result<()> {
        let bytes = if is_little {
            self.0.to_le_bytes()
        } else {
            self.0.to_be_bytes()
        };
        buf[..8].copy_from_slice(&bytes);
        Ok(())
    }

    fn decode(&mut self, buf: &[u8], size: u16, is_little: bool) -> Result<()> {
        if size != 8 {
            return Err(Error::SizeNotAcceptable { actual: size });
        }
        let bytes: [u8; 8] = buf[..8].try_into().expect("slice of 8");
        self.0 = if is_little {
            u64::from_le_bytes(bytes)
        } else {
            u64::from_be_bytes(bytes)
        };
        Ok(())
    }
}
