//! # Sector Node Format
//!
//! Every tree node is exactly one sector. Keys grow forward from the header;
//! payloads pack backward from the sector end; the gap in the middle is the
//! free space:
//!
//! ```text
//! leaf:
//! ┌────────┬──────────┬──────────┬─────────────┬─────────┬─────────┐
//! │ header │ record 0 │ record 1 │ free space  │ value 1 │ value 0 │
//! │ 4 B    │ 22 B     │ 22 B     │             │         │         │
//! └────────┴──────────┴──────────┴─────────────┴─────────┴─────────┘
//!
//! internal:
//! ┌────────┬───────┬──────────┬──────────────┬─────────┬─────────┐
//! │ header │ first │ record 0 │ free space   │ child 1 │ child 0 │
//! │ 4 B    │ 2 B   │ 19 B     │              │ 8 B     │ 8 B     │
//! └────────┴───────┴──────────┴──────────────┴─────────┴─────────┘
//! ```
//!
//! The header is `{version: u8, key_count: u8, used_and_flags: u16}`. The
//! version byte's top bit selects big-endian payload encoding; the low seven
//! bits are the format version. `used_and_flags` carries the leaf flag in
//! bit 15 and the payload byte count in the low bits.
//!
//! An internal node with `k` keys has `k + 1` children; the keyless first
//! child (reached by the 2-byte offset slot after the header) covers
//! everything below the first key. A leaf value longer than
//! [`MAX_INLINE_VALUE`] is stored in its own sector and the record payload
//! becomes a 10-byte overflow reference `{lba: u64, size: u16}`.
//!
//! [`NodeView`] decodes sectors; [`LeafBuilder`] and [`InternalBuilder`]
//! write fresh ones. Published sectors are never edited in place, so there
//! is no mutating view.

use crate::config::SECTOR_SIZE;
use crate::error::{verify, Error, Result};
use crate::types::{Key, Lba};

/// Current node format version (low seven bits of the version byte).
pub const FORMAT_VERSION: u8 = 0x7f;

/// Version-byte flag: payloads are big-endian.
pub const BIG_ENDIAN_FLAG: u8 = 0x80;

/// `used_and_flags` bit marking a leaf node.
pub const LEAF_FLAG: u16 = 0x8000;

/// Low bits of `used_and_flags` holding the payload byte count.
pub const USED_SIZE_MASK: u16 = (SECTOR_SIZE - 1) as u16;

pub const NODE_HEADER_SIZE: usize = 4;
pub const LEAF_RECORD_SIZE: usize = 22;
pub const INTERNAL_RECORD_SIZE: usize = 19;
pub const FIRST_CHILD_SIZE: usize = 2;
pub const OVERFLOW_REF_SIZE: usize = 10;
pub const CHILD_PTR_SIZE: usize = 8;

/// Largest value stored inline in a leaf: one sector minus the header and
/// one leaf record. Anything bigger goes to an overflow sector.
pub const MAX_INLINE_VALUE: usize = SECTOR_SIZE - NODE_HEADER_SIZE - LEAF_RECORD_SIZE;

const _: () = assert!(MAX_INLINE_VALUE == 4070);

pub(crate) fn read_u16(buf: &[u8], off: usize, is_little: bool) -> u16 {
    let bytes = [buf[off], buf[off + 1]];
    if is_little {
        u16::from_le_bytes(bytes)
    } else {
        u16::from_be_bytes(bytes)
    }
}

pub(crate) fn write_u16(buf: &mut [u8], off: usize, value: u16, is_little: bool) {
    let bytes = if is_little {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    buf[off..off + 2].copy_from_slice(&bytes);
}

pub(crate) fn read_u64(buf: &[u8], off: usize, is_little: bool) -> u64 {
    let bytes: [u8; 8] = buf[off..off + 8].try_into().expect("span of 8");
    if is_little {
        u64::from_le_bytes(bytes)
    } else {
        u64::from_be_bytes(bytes)
    }
}

pub(crate) fn write_u64(buf: &mut [u8], off: usize, value: u64, is_little: bool) {
    let bytes = if is_little {
        value.to_le_bytes()
    } else {
        value.to_be_bytes()
    };
    buf[off..off + 8].copy_from_slice(&bytes);
}

/// One decoded leaf record.
#[derive(Debug, Clone, Copy)]
pub struct LeafRecord {
    pub key: Key,
    pub offset: u16,
    pub size: u16,
    pub is_overflow: bool,
}

/// One decoded internal record (separator key plus its child slot offset).
#[derive(Debug, Clone, Copy)]
pub struct InternalRecord {
    pub key: Key,
    pub offset: u16,
}

/// Read-only decoded view over one node sector.
pub struct NodeView<'a> {
    buf: &'a [u8],
    is_little: bool,
    leaf: bool,
    count: u8,
    payload: u16,
}

impl<'a> NodeView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        verify!(
            buf.len() == SECTOR_SIZE,
            "node buffer is {} bytes, want {SECTOR_SIZE}",
            buf.len()
        );

        let version = buf[0];
        verify!(
            version & !BIG_ENDIAN_FLAG == FORMAT_VERSION,
            "unsupported node format version {:#04x}",
            version & !BIG_ENDIAN_FLAG
        );

        let is_little = version & BIG_ENDIAN_FLAG == 0;
        let used_and_flags = read_u16(buf, 2, is_little);

        let node = Self {
            buf,
            is_little,
            leaf: used_and_flags & LEAF_FLAG != 0,
            count: buf[1],
            payload: used_and_flags & USED_SIZE_MASK,
        };
        // A header may claim more records or payload than one sector holds;
        // reject it here so record reads stay in bounds.
        verify!(
            node.used_space() <= SECTOR_SIZE,
            "node claims {} used bytes, sector is {SECTOR_SIZE}",
            node.used_space()
        );
        Ok(node)
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf
    }

    pub fn is_little(&self) -> bool {
        self.is_little
    }

    pub fn key_count(&self) -> usize {
        self.count as usize
    }

    /// Payload bytes packed at the sector's tail.
    pub fn payload_bytes(&self) -> usize {
        self.payload as usize
    }

    /// Total bytes consumed: header, record area, and payload.
    pub fn used_space(&self) -> usize {
        let records = if self.leaf {
            self.count as usize * LEAF_RECORD_SIZE
        } else {
            FIRST_CHILD_SIZE + self.count as usize * INTERNAL_RECORD_SIZE
        };
        NODE_HEADER_SIZE + records + self.payload as usize
    }

    pub fn leaf_record(&self, i: usize) -> Result<LeafRecord> {
        verify!(self.leaf, "leaf record read from an internal node");
        verify!(
            i < self.count as usize,
            "leaf record {i} out of range (node has {})",
            self.count
        );

        let base = NODE_HEADER_SIZE + i * LEAF_RECORD_SIZE;
        Ok(LeafRecord {
            key: Key::new(
                self.buf[base + 20],
                read_u64(self.buf, base, self.is_little),
                read_u64(self.buf, base + 8, self.is_little),
            ),
            offset: read_u16(self.buf, base + 16, self.is_little),
            size: read_u16(self.buf, base + 18, self.is_little),
            is_overflow: self.buf[base + 21] & 0x01 != 0,
        })
    }

    pub fn internal_record(&self, i: usize) -> Result<InternalRecord> {
        verify!(!self.leaf, "internal record read from a leaf node");
        verify!(
            i < self.count as usize,
            "internal record {i} out of range (node has {})",
            self.count
        );

        let base = NODE_HEADER_SIZE + FIRST_CHILD_SIZE + i * INTERNAL_RECORD_SIZE;
        Ok(InternalRecord {
            key: Key::new(
                self.buf[base + 18],
                read_u64(self.buf, base, self.is_little),
                read_u64(self.buf, base + 8, self.is_little),
            ),
            offset: read_u16(self.buf, base + 16, self.is_little),
        })
    }

    /// Payload offset of the keyless first child (internal nodes).
    pub fn first_child_offset(&self) -> Result<u16> {
        verify!(!self.leaf, "first-child slot read from a leaf node");
        Ok(read_u16(self.buf, NODE_HEADER_SIZE, self.is_little))
    }

    /// Decode the child pointer stored at `offset`.
    pub fn child_lba(&self, offset: u16) -> Result<Lba> {
        let offset = offset as usize;
        verify!(
            offset >= NODE_HEADER_SIZE + FIRST_CHILD_SIZE
                && offset + CHILD_PTR_SIZE <= SECTOR_SIZE,
            "child pointer offset {offset} out of bounds"
        );
        Ok(Lba(read_u64(self.buf, offset, self.is_little)))
    }

    /// Decode the overflow reference stored at `offset`.
    pub fn overflow_ref(&self, offset: u16) -> Result<(Lba, u16)> {
        let offset = offset as usize;
        verify!(
            offset >= NODE_HEADER_SIZE + LEAF_RECORD_SIZE
                && offset + OVERFLOW_REF_SIZE <= SECTOR_SIZE,
            "overflow reference offset {offset} out of bounds"
        );
        let size = read_u16(self.buf, offset + 8, self.is_little);
        verify!(
            size as usize <= SECTOR_SIZE,
            "overflow value of {size} bytes exceeds one sector"
        );
        Ok((Lba(read_u64(self.buf, offset, self.is_little)), size))
    }

    /// The inline payload bytes of a leaf record.
    pub fn value_span(&self, record: &LeafRecord) -> Result<&'a [u8]> {
        let offset = record.offset as usize;
        let size = record.size as usize;
        verify!(
            offset + size <= SECTOR_SIZE && offset >= NODE_HEADER_SIZE,
            "leaf value span {offset}+{size} out of bounds"
        );
        Ok(&self.buf[offset..offset + size])
    }

    fn key_at(&self, i: usize) -> Result<Key> {
        if self.leaf {
            Ok(self.leaf_record(i)?.key)
        } else {
            Ok(self.internal_record(i)?.key)
        }
    }

    /// Binary search. Returns `(found, idx)` where `idx` is the number of
    /// stored keys `<= key` (the 1-based index of the last such key, 0 when
    /// every key is greater) and `found` reports an exact match.
    ///
    /// For internal nodes `idx` is the descent slot: 0 selects the keyless
    /// first child, `i > 0` the child of key `i - 1`.
    pub fn search(&self, key: Key) -> Result<(bool, usize)> {
        let count = self.count as usize;
        let mut lo = 0;
        let mut hi = count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid)? <= key {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        let found = lo > 0 && self.key_at(lo - 1)? == key;
        Ok((found, lo))
    }
}

/// Writes one fresh leaf sector front-to-back. The buffer must be zeroed;
/// [`finish`](Self::finish) stamps the header.
pub struct LeafBuilder<'a> {
    buf: &'a mut [u8],
    is_little: bool,
    count: u8,
    payload: u16,
    first_key: Option<Key>,
}

impl<'a> LeafBuilder<'a> {
    pub fn new(buf: &'a mut [u8], is_little: bool) -> Self {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        Self {
            buf,
            is_little,
            count: 0,
            payload: 0,
            first_key: None,
        }
    }

    pub fn record_count(&self) -> usize {
        self.count as usize
    }

    pub fn first_key(&self) -> Option<Key> {
        self.first_key
    }

    /// Total bytes this node would occupy right now.
    pub fn used_space(&self) -> usize {
        NODE_HEADER_SIZE + self.count as usize * LEAF_RECORD_SIZE + self.payload as usize
    }

    /// Whether one more record with `payload_len` payload bytes fits without
    /// the record area colliding with the payload area. Summed additively so
    /// an oversized candidate cannot wrap the arithmetic.
    pub fn fits(&self, payload_len: usize) -> bool {
        NODE_HEADER_SIZE
            + (self.count as usize + 1) * LEAF_RECORD_SIZE
            + self.payload as usize
            + payload_len
            <= SECTOR_SIZE
    }

    /// Append a record. `payload` is the encoded value for inline records or
    /// the 10-byte reference for overflow records.
    pub fn push(&mut self, key: Key, is_overflow: bool, payload: &[u8]) -> Result<()> {
        verify!(
            self.fits(payload.len()),
            "leaf record for {key:?} does not fit ({} bytes)",
            payload.len()
        );

        self.payload += payload.len() as u16;
        let offset = SECTOR_SIZE - self.payload as usize;
        self.buf[offset..offset + payload.len()].copy_from_slice(payload);

        let base = NODE_HEADER_SIZE + self.count as usize * LEAF_RECORD_SIZE;
        write_u64(self.buf, base, key.major, self.is_little);
        write_u64(self.buf, base + 8, key.minor, self.is_little);
        write_u16(self.buf, base + 16, offset as u16, self.is_little);
        write_u16(self.buf, base + 18, payload.len() as u16, self.is_little);
        self.buf[base + 20] = key.kind;
        self.buf[base + 21] = is_overflow as u8;

        self.count += 1;
        self.first_key.get_or_insert(key);
        Ok(())
    }

    /// Stamp the header. An empty leaf (count 0) is valid; it is the root of
    /// an empty tree.
    pub fn finish(self) {
        self.buf[0] = FORMAT_VERSION | if self.is_little { 0 } else { BIG_ENDIAN_FLAG };
        self.buf[1] = self.count;
        write_u16(self.buf, 2, self.payload | LEAF_FLAG, self.is_little);
    }
}

/// Writes one fresh internal sector. Children arrive in key order; the
/// first child takes the keyless slot, every later child must bring its
/// separator key.
pub struct InternalBuilder<'a> {
    buf: &'a mut [u8],
    is_little: bool,
    children: u8,
    payload: u16,
}

impl<'a> InternalBuilder<'a> {
    pub fn new(buf: &'a mut [u8], is_little: bool) -> Self {
        debug_assert_eq!(buf.len(), SECTOR_SIZE);
        Self {
            buf,
            is_little,
            children: 0,
            payload: 0,
        }
    }

    pub fn child_count(&self) -> usize {
        self.children as usize
    }

    pub fn payload_bytes(&self) -> usize {
        self.payload as usize
    }

    pub fn fits_child(&self) -> bool {
        NODE_HEADER_SIZE
            + FIRST_CHILD_SIZE
            + self.children as usize * INTERNAL_RECORD_SIZE
            + self.payload as usize
            + CHILD_PTR_SIZE
            <= SECTOR_SIZE
    }

    pub fn push_child(&mut self, key: Option<Key>, lba: Lba) -> Result<()> {
        verify!(self.fits_child(), "internal node full at child {}", self.children);

        self.payload += CHILD_PTR_SIZE as u16;
        let offset = SECTOR_SIZE - self.payload as usize;
        write_u64(self.buf, offset, lba.0, self.is_little);

        if self.children == 0 {
            write_u16(self.buf, NODE_HEADER_SIZE, offset as u16, self.is_little);
        } else {
            let key = key.ok_or_else(|| {
                Error::corruption("non-first child of an internal node has no separator key")
            })?;
            let base = NODE_HEADER_SIZE
                + FIRST_CHILD_SIZE
                + (self.children as usize - 1) * INTERNAL_RECORD_SIZE;
            write_u64(self.buf, base, key.major, self.is_little);
            write_u64(self.buf, base + 8, key.minor, self.is_little);
            write_u16(self.buf, base + 16, offset as u16, self.is_little);
            self.buf[base + 18] = key.kind;
        }

        self.children += 1;
        Ok(())
    }

    /// Stamp the header. A single-child node (zero keys) is legal; descent
    /// treats its keyless slot as the only route down.
    pub fn finish(self) -> Result<()> {
        verify!(
            self.children >= 1,
            "internal node written with no children"
        );
        self.buf[0] = FORMAT_VERSION | if self.is_little { 0 } else { BIG_ENDIAN_FLAG };
        self.buf[1] = self.children - 1;
        write_u16(self.buf, 2, self.payload, self.is_little);
        Ok(())
    }
}

/// Encode an overflow reference into `buf` (10 bytes).
pub fn encode_overflow_ref(buf: &mut [u8], lba: Lba, size: u16, is_little: bool) {
    write_u64(buf, 0, lba.0, is_little);
    write_u16(buf, 8, size, is_little);
}
