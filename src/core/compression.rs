//! Decoding of compressed clusters
//!
//! QCOW stores a compressed cluster as a raw deflate stream (no zlib wrapper)
//! or, for version 3 images that declare it, as a single Zstd frame. The
//! stored length is rounded up to whole 512-byte sectors, so the input may
//! carry trailing bytes that belong to whatever follows on disk.

use crate::error::{QcowError, Result};
use flate2::read::DeflateDecoder;
use serde::{Deserialize, Serialize};
use std::io::Read;

/// Compression method declared by the image header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CompressionKind {
    /// No compression; compressed clusters are undecodable
    None = 0xff,
    /// Raw deflate
    Zlib = 0,
    /// Zstandard
    Zstd = 1,
}

impl CompressionKind {
    /// Convert from the version 3 `compression_type` header byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CompressionKind::Zlib),
            1 => Some(CompressionKind::Zstd),
            _ => None,
        }
    }
}

/// Decompress one cluster
///
/// The output must be exactly `cluster_size` bytes. A stream that ends early,
/// produces more than one cluster, or fails to decode yields
/// [`QcowError::DecompressionError`].
pub fn decompress_cluster(
    data: &[u8],
    kind: CompressionKind,
    cluster_size: usize,
) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Err(QcowError::DecompressionError(
            "compressed cluster in an image without compression".to_string(),
        )),
        CompressionKind::Zlib => {
            let decoder = DeflateDecoder::new(data);
            read_one_cluster(decoder, cluster_size, "Deflate")
        }
        CompressionKind::Zstd => {
            let decoder = zstd::stream::read::Decoder::with_buffer(data)
                .map_err(|e| {
                    QcowError::DecompressionError(format!("Zstd decoder setup failed: {}", e))
                })?
                .single_frame();
            read_one_cluster(decoder, cluster_size, "Zstd")
        }
    }
}

fn read_one_cluster<R: Read>(mut decoder: R, cluster_size: usize, method: &str) -> Result<Vec<u8>> {
    let mut output = vec![0u8; cluster_size];
    decoder.read_exact(&mut output).map_err(|e| {
        QcowError::DecompressionError(format!(
            "{} stream did not yield a full {} byte cluster: {}",
            method, cluster_size, e
        ))
    })?;

    let mut probe = [0u8; 1];
    match decoder.read(&mut probe) {
        Ok(0) => Ok(output),
        Ok(_) => Err(QcowError::DecompressionError(format!(
            "{} stream decodes to more than {} bytes",
            method, cluster_size
        ))),
        Err(e) => Err(QcowError::DecompressionError(format!(
            "{} stream is corrupt past the cluster end: {}",
            method, e
        ))),
    }
}
