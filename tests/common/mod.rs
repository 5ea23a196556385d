//! In-memory QCOW image builder shared by the integration tests
//!
//! Layout of a built image (offsets in clusters):
//!
//! ```text
//! [0] header + backing name   [1..] L1 table   [..] L2 tables   [..] data
//! ```
//!
//! Compressed streams are packed back to back after the standard data
//! clusters and are deliberately left unaligned.

#![allow(dead_code)]

use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::io::Write;

pub const FLAG_COPIED: u64 = 1 << 63;
pub const FLAG_COMPRESSED: u64 = 1 << 62;
pub const FLAG_ZERO: u64 = 1;

#[derive(Debug, Clone)]
pub enum ClusterContent {
    /// Stored verbatim
    Data(Vec<u8>),
    /// Stored as a raw deflate stream
    Deflate(Vec<u8>),
    /// Stored as a Zstd frame (version 3 only)
    Zstd(Vec<u8>),
    /// Version 3 zero flag
    Zero,
    /// Arbitrary L2 entry written as-is
    RawEntry(u64),
}

/// Offsets of the structures inside a built image
#[derive(Debug, Clone, Default)]
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub l1_offset: u64,
    pub l1_entries: u64,
    /// L1 index to L2 table offset
    pub l2_offsets: BTreeMap<u64, u64>,
    /// Logical cluster index to host offset of its data or stream
    pub data_offsets: BTreeMap<u64, u64>,
}

impl BuiltImage {
    pub fn write_u64(&mut self, offset: u64, value: u64) {
        let offset = offset as usize;
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) {
        let offset = offset as usize;
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn read_u64(&self, offset: u64) -> u64 {
        let offset = offset as usize;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_be_bytes(raw)
    }
}

#[derive(Debug, Clone)]
pub struct ImageBuilder {
    version: u32,
    cluster_bits: u32,
    media_size: u64,
    clusters: BTreeMap<u64, ClusterContent>,
    backing_name: Option<String>,
    zstd: bool,
    incompatible: u64,
}

impl ImageBuilder {
    pub fn new(version: u32, cluster_bits: u32, media_size: u64) -> Self {
        ImageBuilder {
            version,
            cluster_bits,
            media_size,
            clusters: BTreeMap::new(),
            backing_name: None,
            zstd: false,
            incompatible: 0,
        }
    }

    pub fn cluster_size(&self) -> u64 {
        1 << self.cluster_bits
    }

    pub fn cluster(mut self, index: u64, content: ClusterContent) -> Self {
        self.clusters.insert(index, content);
        self
    }

    pub fn data(self, index: u64, bytes: Vec<u8>) -> Self {
        self.cluster(index, ClusterContent::Data(bytes))
    }

    pub fn backing_name(mut self, name: &str) -> Self {
        self.backing_name = Some(name.to_string());
        self
    }

    /// Declare Zstd as the compression type (version 3)
    pub fn zstd(mut self) -> Self {
        self.zstd = true;
        self
    }

    pub fn incompatible_features(mut self, bits: u64) -> Self {
        self.incompatible = bits;
        self
    }

    fn l2_bits(&self) -> u32 {
        self.cluster_bits - 3
    }

    fn header_length(&self) -> usize {
        match self.version {
            1 => 48,
            2 => 72,
            _ if self.zstd => 112,
            _ => 104,
        }
    }

    /// Logical contents the image should read back as, without backing data
    pub fn expected(&self) -> Vec<u8> {
        let cluster_size = self.cluster_size() as usize;
        let mut media = vec![0u8; self.media_size as usize];
        for (&index, content) in &self.clusters {
            let bytes = match content {
                ClusterContent::Data(bytes)
                | ClusterContent::Deflate(bytes)
                | ClusterContent::Zstd(bytes) => bytes,
                _ => continue,
            };
            let start = index as usize * cluster_size;
            if start >= media.len() {
                continue;
            }
            let end = (start + cluster_size).min(media.len());
            media[start..end].copy_from_slice(&bytes[..end - start]);
        }
        media
    }

    pub fn build(&self) -> BuiltImage {
        let cluster_size = self.cluster_size();
        let l2_entries = 1u64 << self.l2_bits();
        let l1_entries = self
            .media_size
            .div_ceil(cluster_size * l2_entries)
            .max(1);

        let l1_offset = cluster_size;
        let l1_clusters = (l1_entries * 8).div_ceil(cluster_size);
        let mut next = l1_offset + l1_clusters * cluster_size;

        let mut image = BuiltImage {
            l1_offset,
            l1_entries,
            ..BuiltImage::default()
        };

        for &index in self.clusters.keys() {
            let l1_index = index / l2_entries;
            if let std::collections::btree_map::Entry::Vacant(slot) =
                image.l2_offsets.entry(l1_index)
            {
                slot.insert(next);
                next += cluster_size;
            }
        }

        // Standard clusters first, cluster aligned.
        let mut streams = Vec::new();
        let mut l2_raw: BTreeMap<u64, u64> = BTreeMap::new();
        let mut payloads: Vec<(u64, Vec<u8>)> = Vec::new();
        for (&index, content) in &self.clusters {
            match content {
                ClusterContent::Data(bytes) => {
                    assert_eq!(bytes.len() as u64, cluster_size);
                    image.data_offsets.insert(index, next);
                    let raw = if self.version == 1 { next } else { next | FLAG_COPIED };
                    l2_raw.insert(index, raw);
                    payloads.push((next, bytes.clone()));
                    next += cluster_size;
                }
                ClusterContent::Deflate(bytes) => streams.push((index, deflate(bytes))),
                ClusterContent::Zstd(bytes) => streams.push((index, zstd_frame(bytes))),
                ClusterContent::Zero => {
                    l2_raw.insert(index, FLAG_ZERO);
                }
                ClusterContent::RawEntry(raw) => {
                    l2_raw.insert(index, *raw);
                }
            }
        }

        // Odd start so streams do not begin on a sector boundary.
        next += 3;
        for (index, stream) in streams {
            image.data_offsets.insert(index, next);
            l2_raw.insert(index, self.compressed_entry(next, stream.len() as u64));
            payloads.push((next, stream.clone()));
            next += stream.len() as u64 + 5;
        }

        let total = next.div_ceil(512) * 512;
        image.bytes = vec![0u8; total as usize];
        self.write_header(&mut image);

        for (&l1_index, &l2_offset) in &image.l2_offsets.clone() {
            let raw = if self.version == 1 {
                l2_offset
            } else {
                l2_offset | FLAG_COPIED
            };
            image.write_u64(l1_offset + l1_index * 8, raw);
        }
        for (&index, &raw) in &l2_raw {
            let l2_offset = image.l2_offsets[&(index / l2_entries)];
            image.write_u64(l2_offset + (index % l2_entries) * 8, raw);
        }
        for (offset, bytes) in payloads {
            let offset = offset as usize;
            image.bytes[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }

        image
    }

    fn compressed_entry(&self, offset: u64, len: u64) -> u64 {
        if self.version == 1 {
            let shift = 63 - self.cluster_bits;
            return (1 << 63) | (len << shift) | offset;
        }
        let offset_bits = 62 - (self.cluster_bits - 8);
        let sectors = (offset % 512 + len).div_ceil(512);
        assert!(sectors <= 1 << (self.cluster_bits - 8), "stream too long");
        FLAG_COMPRESSED | ((sectors - 1) << offset_bits) | offset
    }

    fn write_header(&self, image: &mut BuiltImage) {
        let header_length = self.header_length();
        let bytes = &mut image.bytes;
        bytes[0..4].copy_from_slice(b"QFI\xfb");
        bytes[4..8].copy_from_slice(&self.version.to_be_bytes());

        if let Some(name) = &self.backing_name {
            let name_offset = header_length.div_ceil(8) * 8;
            bytes[name_offset..name_offset + name.len()].copy_from_slice(name.as_bytes());
            bytes[8..16].copy_from_slice(&(name_offset as u64).to_be_bytes());
            bytes[16..20].copy_from_slice(&(name.len() as u32).to_be_bytes());
        }

        bytes[24..32].copy_from_slice(&self.media_size.to_be_bytes());

        if self.version == 1 {
            bytes[32] = self.cluster_bits as u8;
            bytes[33] = self.l2_bits() as u8;
            bytes[40..48].copy_from_slice(&image.l1_offset.to_be_bytes());
            return;
        }

        bytes[20..24].copy_from_slice(&self.cluster_bits.to_be_bytes());
        bytes[36..40].copy_from_slice(&(image.l1_entries as u32).to_be_bytes());
        bytes[40..48].copy_from_slice(&image.l1_offset.to_be_bytes());

        if self.version == 3 {
            let mut incompatible = self.incompatible;
            if self.zstd {
                incompatible |= 1 << 3;
            }
            bytes[72..80].copy_from_slice(&incompatible.to_be_bytes());
            bytes[96..100].copy_from_slice(&4u32.to_be_bytes());
            bytes[100..104].copy_from_slice(&(header_length as u32).to_be_bytes());
            if self.zstd {
                bytes[104] = 1;
            }
        }
    }
}

pub fn deflate(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn zstd_frame(bytes: &[u8]) -> Vec<u8> {
    zstd::stream::encode_all(bytes, 3).unwrap()
}

/// Deterministic, compressible cluster contents
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i / 7) as u8))
        .collect()
}

/// Deterministic, poorly compressible contents
pub fn noise(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as u8
        })
        .collect()
}

/// A version 2 image with a mix of allocated, compressed and sparse clusters
pub fn mixed_image(media_size: u64) -> ImageBuilder {
    let builder = ImageBuilder::new(2, 12, media_size);
    let cluster = builder.cluster_size() as usize;
    builder
        .data(0, noise(1, cluster))
        .cluster(1, ClusterContent::Deflate(pattern(0x10, cluster)))
        .data(3, pattern(0x30, cluster))
        .cluster(5, ClusterContent::Deflate(pattern(0x50, cluster)))
        .data(6, noise(6, cluster))
}
