//! L1 and L2 lookup tables and their on-disk entry encodings
//!
//! ```text
//! version 2/3 L1 entry            version 2/3 L2 entry (standard)
//! ┌──┬───────┬──────────┬──────┐  ┌──┬──┬─────┬──────────┬──────┬──┐
//! │63│62..56 │ 55..9    │ 8..0 │  │63│62│61.56│ 55..9    │ 8..1 │0 │
//! │C │ rsvd  │ L2 offset│ rsvd │  │C │Z │rsvd │ offset   │ rsvd │0?│
//! └──┴───────┴──────────┴──────┘  └──┴──┴─────┴──────────┴──────┴──┘
//!
//! version 2/3 compressed L2 entry, x = 62 - (cluster_bits - 8)
//! ┌──┬──┬──────────────────────┬──────────────────────┐
//! │63│62│ 61..x                │ x-1..0               │
//! │C │1 │ extra 512B sectors   │ host byte offset     │
//! └──┴──┴──────────────────────┴──────────────────────┘
//! ```
//!
//! Version 1 stores plain offsets in L1 entries, and its L2 entries use bit 63
//! as the compressed flag with the compressed byte count packed above the
//! offset.

use crate::error::{QcowError, Result};
use crate::header::ImageHeader;
use crate::io::ByteSource;
use byteorder::{BigEndian, ByteOrder};

pub const OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;
pub const FLAG_COPIED: u64 = 1 << 63;
pub const FLAG_COMPRESSED: u64 = 1 << 62;
pub const FLAG_ZERO: u64 = 1;
pub const QCOW1_FLAG_COMPRESSED: u64 = 1 << 63;
pub const COMPRESSED_SECTOR_SIZE: u64 = 512;

/// Decoded L2 entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Entry {
    /// No data in this image
    Unallocated,
    /// Reads as zeros regardless of any backing image
    Zero,
    /// Cluster stored verbatim at the host offset
    Standard(u64),
    /// Compressed cluster stream at the host offset
    Compressed { offset: u64, compressed_len: u64 },
}

/// Bit layout of table entries for one image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLayout {
    version: u32,
    cluster_bits: u32,
}

impl EntryLayout {
    pub fn new(header: &ImageHeader) -> Self {
        EntryLayout {
            version: header.version,
            cluster_bits: header.cluster_bits,
        }
    }

    /// L2 table offset referenced by an L1 entry, or `None` when unallocated
    pub fn l1_offset(&self, raw: u64) -> Option<u64> {
        let offset = if self.version == 1 {
            raw
        } else {
            raw & OFFSET_MASK
        };
        (offset != 0).then_some(offset)
    }

    pub fn decode_l2(&self, raw: u64) -> L2Entry {
        if self.version == 1 {
            return self.decode_l2_v1(raw);
        }

        if raw & FLAG_COMPRESSED != 0 {
            let offset_bits = 62 - (self.cluster_bits - 8);
            let offset = raw & ((1u64 << offset_bits) - 1);
            let sector_mask = (1u64 << (self.cluster_bits - 8)) - 1;
            let extra_sectors = (raw >> offset_bits) & sector_mask;
            let compressed_len =
                (extra_sectors + 1) * COMPRESSED_SECTOR_SIZE - (offset % COMPRESSED_SECTOR_SIZE);
            return L2Entry::Compressed {
                offset,
                compressed_len,
            };
        }

        if self.version >= 3 && raw & FLAG_ZERO != 0 {
            return L2Entry::Zero;
        }

        match raw & OFFSET_MASK {
            0 => L2Entry::Unallocated,
            offset => L2Entry::Standard(offset),
        }
    }

    fn decode_l2_v1(&self, raw: u64) -> L2Entry {
        if raw & QCOW1_FLAG_COMPRESSED != 0 {
            let shift = 63 - self.cluster_bits;
            let offset = raw & ((1u64 << shift) - 1);
            let compressed_len = (raw >> shift) & ((1u64 << self.cluster_bits) - 1);
            return L2Entry::Compressed {
                offset,
                compressed_len,
            };
        }

        match raw {
            0 => L2Entry::Unallocated,
            offset => L2Entry::Standard(offset),
        }
    }
}

/// Top-level lookup table, loaded eagerly at open
#[derive(Debug, Clone)]
pub struct L1Table {
    entries: Vec<u64>,
}

impl L1Table {
    pub fn load(source: &dyn ByteSource, header: &ImageHeader) -> Result<Self> {
        let entries = read_entries(
            source,
            header.l1_table_offset,
            header.l1_table_entries as usize,
        )?;
        Ok(L1Table { entries })
    }

    pub fn from_entries(entries: Vec<u64>) -> Self {
        L1Table { entries }
    }

    pub fn get(&self, index: u64) -> Option<u64> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of L2 tables actually referenced
    pub fn allocated_count(&self, layout: &EntryLayout) -> usize {
        self.entries
            .iter()
            .filter(|&&raw| layout.l1_offset(raw).is_some())
            .count()
    }
}

/// Second-level lookup table, loaded on demand
#[derive(Debug, Clone)]
pub struct L2Table {
    entries: Vec<u64>,
}

impl L2Table {
    pub fn load(source: &dyn ByteSource, offset: u64, entry_count: usize) -> Result<Self> {
        let entries = read_entries(source, offset, entry_count)?;
        Ok(L2Table { entries })
    }

    pub fn get(&self, index: u64) -> Option<u64> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get(i))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn read_entries(source: &dyn ByteSource, offset: u64, count: usize) -> Result<Vec<u64>> {
    let byte_len = count * 8;
    let bytes = source.read_vec_at(offset, byte_len)?;
    if bytes.len() != byte_len {
        return Err(QcowError::TruncatedImage {
            offset,
            expected: byte_len as u64,
            actual: bytes.len() as u64,
        });
    }

    let mut entries = vec![0u64; count];
    BigEndian::read_u64_into(&bytes, &mut entries);
    Ok(entries)
}
