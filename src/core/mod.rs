//! Image reading internals
//!
//! - [`error`] - Error type shared by every layer
//! - [`io`] - Positional byte sources (file, memory map, memory)
//! - [`header`] - Header decoding and validation for versions 1 to 3
//! - [`table`] - L1/L2 table loading and entry decoding
//! - [`translator`] - Logical offset to physical cluster lookup
//! - [`compression`] - Deflate and Zstd cluster decompression
//! - [`cluster`] - Cluster materialization and caching
//! - [`config`] - Reader configuration
//! - [`file`] - The read engine
//! - [`mount`] - Lock-protected handle for concurrent readers

pub mod cluster;
pub mod compression;
pub mod config;
pub mod error;
pub mod file;
pub mod header;
pub mod io;
pub mod mount;
pub mod table;
pub mod translator;
