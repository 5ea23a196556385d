//! Logical offset to physical cluster translation
//!
//! A logical offset splits into an L1 index, an L2 index and an offset inside
//! the cluster:
//!
//! ```text
//!  63 ............ l2_bits+cluster_bits ... cluster_bits ......... 0
//! ┌──────────────────────┬──────────────────────┬──────────────────┐
//! │       L1 index       │       L2 index       │ intra-cluster    │
//! └──────────────────────┴──────────────────────┴──────────────────┘
//! ```
//!
//! Table offsets read from disk are untrusted. Every L2 table and data
//! cluster location is checked against the byte source before it is used;
//! a dangling reference surfaces as [`QcowError::CorruptMetadata`] for the
//! read that hit it.

use crate::error::{QcowError, Result};
use crate::header::ImageHeader;
use crate::io::ByteSource;
use crate::table::{EntryLayout, L1Table, L2Entry, L2Table};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where the bytes of one logical cluster come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhysicalLocation {
    /// Reads as zeros without touching the byte source
    Sparse,
    /// Uncompressed cluster at a host offset
    Allocated(u64),
    /// Compressed stream at a host offset
    Compressed { offset: u64, compressed_len: u64 },
    /// Not present here; re-translate against the backing image
    Backing,
}

/// L2 table cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranslatorStats {
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub cached_tables: usize,
}

/// Two-level lookup from logical offsets to physical locations
pub struct ClusterTranslator {
    layout: EntryLayout,
    l1: L1Table,
    cluster_bits: u32,
    l2_bits: u32,
    media_size: u64,
    has_backing: bool,
    // Version 1 writers did not align clusters.
    aligned: bool,
    l2_cache: Option<LruCache<u64, Arc<L2Table>>>,
    stats: TranslatorStats,
}

impl ClusterTranslator {
    /// Load the L1 table and set up the L2 cache
    ///
    /// `l2_cache_capacity` of zero disables caching; every translation then
    /// re-reads its L2 table.
    pub fn new(
        source: &dyn ByteSource,
        header: &ImageHeader,
        l2_cache_capacity: usize,
    ) -> Result<Self> {
        let l1 = L1Table::load(source, header)?;
        let layout = EntryLayout::new(header);

        debug!(
            "Loaded L1 table: {} entries, {} referencing L2 tables",
            l1.len(),
            l1.allocated_count(&layout)
        );

        Ok(ClusterTranslator {
            layout,
            l1,
            cluster_bits: header.cluster_bits,
            l2_bits: header.l2_bits,
            media_size: header.virtual_disk_size,
            has_backing: header.has_backing_file(),
            aligned: header.version >= 2,
            l2_cache: NonZeroUsize::new(l2_cache_capacity).map(LruCache::new),
            stats: TranslatorStats::default(),
        })
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    pub fn stats(&self) -> TranslatorStats {
        TranslatorStats {
            cached_tables: self.l2_cache.as_ref().map_or(0, |c| c.len()),
            ..self.stats
        }
    }

    /// Split a logical offset into (L1 index, L2 index, intra-cluster offset)
    pub fn split(&self, logical_offset: u64) -> (u64, u64, u64) {
        let cluster_index = logical_offset >> self.cluster_bits;
        let l1_index = cluster_index >> self.l2_bits;
        let l2_index = cluster_index & ((1u64 << self.l2_bits) - 1);
        let intra = logical_offset & (self.cluster_size() - 1);
        (l1_index, l2_index, intra)
    }

    /// Resolve the cluster containing `logical_offset`
    pub fn translate(
        &mut self,
        source: &dyn ByteSource,
        logical_offset: u64,
    ) -> Result<PhysicalLocation> {
        if logical_offset >= self.media_size {
            return Err(QcowError::OffsetOutOfBounds {
                offset: logical_offset,
                limit: self.media_size,
            });
        }

        let (l1_index, l2_index, _) = self.split(logical_offset);
        let l1_entry = self
            .l1
            .get(l1_index)
            .ok_or(QcowError::OffsetOutOfBounds {
                offset: logical_offset,
                limit: (self.l1.len() as u64) << (self.l2_bits + self.cluster_bits),
            })?;

        let Some(l2_offset) = self.layout.l1_offset(l1_entry) else {
            return Ok(self.unallocated());
        };

        let l2 = self.l2_table(source, l2_offset)?;
        let raw = l2.get(l2_index).ok_or_else(|| {
            QcowError::CorruptMetadata(format!(
                "L2 index {} beyond table of {} entries",
                l2_index,
                l2.len()
            ))
        })?;

        let location = match self.layout.decode_l2(raw) {
            L2Entry::Unallocated => self.unallocated(),
            L2Entry::Zero => PhysicalLocation::Sparse,
            L2Entry::Standard(offset) => {
                self.check_data_cluster(source, offset)?;
                PhysicalLocation::Allocated(offset)
            }
            L2Entry::Compressed {
                offset,
                compressed_len,
            } => {
                if compressed_len == 0 || offset >= source.size() {
                    return Err(QcowError::CorruptMetadata(format!(
                        "compressed cluster at 0x{:x} ({} bytes) lies outside the image",
                        offset, compressed_len
                    )));
                }
                PhysicalLocation::Compressed {
                    offset,
                    compressed_len,
                }
            }
        };

        trace!(
            "Translated 0x{:x} (l1={}, l2={}) to {:?}",
            logical_offset,
            l1_index,
            l2_index,
            location
        );
        Ok(location)
    }

    fn unallocated(&self) -> PhysicalLocation {
        if self.has_backing {
            PhysicalLocation::Backing
        } else {
            PhysicalLocation::Sparse
        }
    }

    fn check_data_cluster(&self, source: &dyn ByteSource, offset: u64) -> Result<()> {
        let cluster_size = self.cluster_size();
        if self.aligned && offset % cluster_size != 0 {
            return Err(QcowError::CorruptMetadata(format!(
                "data cluster offset 0x{:x} is not cluster aligned",
                offset
            )));
        }
        let end = offset.checked_add(cluster_size);
        if end.map_or(true, |end| end > source.size()) {
            return Err(QcowError::CorruptMetadata(format!(
                "data cluster at 0x{:x} extends past the image end ({} bytes)",
                offset,
                source.size()
            )));
        }
        Ok(())
    }

    fn l2_table(&mut self, source: &dyn ByteSource, offset: u64) -> Result<Arc<L2Table>> {
        if let Some(cache) = self.l2_cache.as_mut() {
            if let Some(table) = cache.get(&offset) {
                self.stats.l2_hits += 1;
                return Ok(Arc::clone(table));
            }
        }
        self.stats.l2_misses += 1;

        let entry_count = 1u64 << self.l2_bits;
        let table_bytes = entry_count * 8;
        if self.aligned && offset % self.cluster_size() != 0 {
            return Err(QcowError::CorruptMetadata(format!(
                "L2 table offset 0x{:x} is not cluster aligned",
                offset
            )));
        }
        let end = offset.checked_add(table_bytes);
        if end.map_or(true, |end| end > source.size()) {
            return Err(QcowError::CorruptMetadata(format!(
                "L2 table at 0x{:x} extends past the image end ({} bytes)",
                offset,
                source.size()
            )));
        }

        debug!("Loading L2 table at 0x{:x} ({} entries)", offset, entry_count);
        let table = Arc::new(L2Table::load(source, offset, entry_count as usize)?);

        if let Some(cache) = self.l2_cache.as_mut() {
            cache.put(offset, Arc::clone(&table));
        }
        Ok(table)
    }
}
