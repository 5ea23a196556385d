//! Materializing the bytes of one cluster
//!
//! Sparse clusters share a single zero buffer and never touch the byte
//! source. Allocated and compressed clusters are read (and decompressed) in
//! full and kept in a small per-handle LRU keyed by their physical
//! location, so sequential sub-cluster reads hit the source once per cluster.
//! Raw and compressed entries that alias one host offset get separate slots.

use crate::compression::{decompress_cluster, CompressionKind};
use crate::error::{QcowError, Result};
use crate::io::ByteSource;
use crate::translator::PhysicalLocation;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::debug;

/// Reads data from a backing image on behalf of a child image
///
/// Implemented by the read engine; kept as a trait so the reader does not
/// depend on the handle type.
pub trait BackingReader {
    /// Read `buf.len()` bytes at a logical offset of the backing image,
    /// returning how many bytes lay inside its media
    fn read_backing(&mut self, logical_offset: u64, buf: &mut [u8]) -> Result<usize>;
}

/// Cluster cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterReaderStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub decompressed: u64,
    pub backing_reads: u64,
}

pub struct ClusterReader {
    cluster_size: usize,
    compression: CompressionKind,
    zero_cluster: Arc<[u8]>,
    cache: Option<LruCache<PhysicalLocation, Arc<[u8]>>>,
    stats: ClusterReaderStats,
}

impl ClusterReader {
    /// `cache_capacity` of zero disables the cluster cache
    pub fn new(cluster_size: u64, compression: CompressionKind, cache_capacity: usize) -> Self {
        let cluster_size = cluster_size as usize;
        ClusterReader {
            cluster_size,
            compression,
            zero_cluster: Arc::from(vec![0u8; cluster_size]),
            cache: NonZeroUsize::new(cache_capacity).map(LruCache::new),
            stats: ClusterReaderStats::default(),
        }
    }

    pub fn cluster_size(&self) -> usize {
        self.cluster_size
    }

    pub fn stats(&self) -> ClusterReaderStats {
        self.stats
    }

    /// Produce the decoded contents of one cluster
    ///
    /// `cluster_start` is the logical offset of the cluster, used only when
    /// the location defers to the backing image.
    pub fn materialize(
        &mut self,
        location: PhysicalLocation,
        source: &dyn ByteSource,
        backing: Option<&mut dyn BackingReader>,
        cluster_start: u64,
    ) -> Result<Arc<[u8]>> {
        match location {
            PhysicalLocation::Sparse => Ok(Arc::clone(&self.zero_cluster)),
            PhysicalLocation::Allocated(offset) => {
                self.cached_or_load(location, |reader| reader.read_allocated(source, offset))
            }
            PhysicalLocation::Compressed {
                offset,
                compressed_len,
            } => self.cached_or_load(location, |reader| {
                reader.read_compressed(source, offset, compressed_len)
            }),
            PhysicalLocation::Backing => {
                let backing = backing.ok_or(QcowError::BackingFileUnavailable)?;
                self.stats.backing_reads += 1;

                let mut data = vec![0u8; self.cluster_size];
                // Past the end of the backing media the cluster reads as zeros.
                backing.read_backing(cluster_start, &mut data)?;
                Ok(Arc::from(data))
            }
        }
    }

    fn cached_or_load<F>(&mut self, location: PhysicalLocation, load: F) -> Result<Arc<[u8]>>
    where
        F: FnOnce(&mut Self) -> Result<Vec<u8>>,
    {
        if let Some(cache) = self.cache.as_mut() {
            if let Some(data) = cache.get(&location) {
                self.stats.cache_hits += 1;
                return Ok(Arc::clone(data));
            }
        }
        self.stats.cache_misses += 1;

        let data: Arc<[u8]> = Arc::from(load(self)?);
        if let Some(cache) = self.cache.as_mut() {
            cache.put(location, Arc::clone(&data));
        }
        Ok(data)
    }

    fn read_allocated(&self, source: &dyn ByteSource, offset: u64) -> Result<Vec<u8>> {
        let data = source.read_vec_at(offset, self.cluster_size)?;
        if data.len() != self.cluster_size {
            return Err(QcowError::TruncatedImage {
                offset,
                expected: self.cluster_size as u64,
                actual: data.len() as u64,
            });
        }
        Ok(data)
    }

    fn read_compressed(
        &mut self,
        source: &dyn ByteSource,
        offset: u64,
        compressed_len: u64,
    ) -> Result<Vec<u8>> {
        // The sector-rounded length may run past the end of the image.
        let available = source.size().saturating_sub(offset);
        let len = compressed_len.min(available) as usize;
        let stored = source.read_vec_at(offset, len)?;

        debug!(
            "Decompressing cluster at 0x{:x} ({} stored bytes, {:?})",
            offset,
            stored.len(),
            self.compression
        );
        let data = decompress_cluster(&stored, self.compression, self.cluster_size)?;
        self.stats.decompressed += 1;
        Ok(data)
    }
}
