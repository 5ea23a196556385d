//! # qcow-rs - Read-only access to QCOW disk images
//!
//! `qcow-rs` exposes the virtual disk stored in a QCOW image (versions 1, 2
//! and 3) as a flat, randomly addressable byte range:
//!
//! - **Sparse aware**: unallocated and zero clusters read as zeros without I/O
//! - **Compressed clusters**: deflate and Zstd
//! - **Backing chains**: attach parent images with cycle and depth checks
//! - **Defensive parsing**: every on-disk offset is bounds checked before use
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use qcow_rs::{QcowFile, Result, Whence};
//!
//! # fn main() -> Result<()> {
//! let mut image = QcowFile::open_path("disk.qcow2")?;
//! println!("media size: {} bytes", image.media_size()?);
//!
//! // Sequential reads advance the cursor
//! image.seek(0, Whence::Set)?;
//! let mbr = image.read(512)?;
//!
//! // Positioned reads leave it alone
//! let sector = image.read_at(1 << 20, 512)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backing Images
//!
//! ```rust,no_run
//! use qcow_rs::{QcowFile, Result};
//!
//! # fn main() -> Result<()> {
//! let mut child = QcowFile::open_path("overlay.qcow2")?;
//! let reference = child.backing_file_reference()?.map(str::to_owned);
//! if let Some(name) = reference {
//!     let parent = QcowFile::open_path(name)?;
//!     child.set_backing(parent)?;
//! }
//! let data = child.read_at(0, 4096)?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{
    cluster, compression, config, error, file, header, io, mount, table, translator,
};

pub use crate::core::{
    cluster::{BackingReader, ClusterReader, ClusterReaderStats},
    compression::CompressionKind,
    config::{ReaderConfig, ReaderConfigBuilder},
    error::{QcowError, Result},
    file::{AccessMode, ImageStats, QcowFile, Whence},
    header::ImageHeader,
    io::{ByteSource, FileSource, MemorySource, MmapSource},
    mount::{MountHandle, MOUNTED_FILE_NAME},
    translator::{ClusterTranslator, PhysicalLocation, TranslatorStats},
};
