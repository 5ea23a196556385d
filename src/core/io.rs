//! Positional byte sources that images are read from
//!
//! The engine never opens files itself; it consumes anything implementing
//! [`ByteSource`]. Reads are positional and never move a shared cursor, so a
//! single source may serve several independent handles at once.

use memmap2::Mmap;
use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

/// Random-access readable byte stream
pub trait ByteSource: Send + Sync {
    /// Total number of bytes in the source
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns the number of bytes read. A short count is only allowed at the
    /// true end of the source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Stable identity of the underlying storage, if known
    ///
    /// Used to detect a backing chain that refers back to itself.
    fn identity(&self) -> Option<String> {
        None
    }

    /// Read `len` bytes at `offset`, truncated at the end of the source
    fn read_vec_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = self.read_at(offset + filled as u64, &mut buffer[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn identity(&self) -> Option<String> {
        (**self).identity()
    }
}

impl<T: ByteSource + ?Sized> ByteSource for Box<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }

    fn identity(&self) -> Option<String> {
        (**self).identity()
    }
}

/// File-backed source using positional reads
pub struct FileSource {
    file: File,
    size: u64,
    path: std::path::PathBuf,
}

impl FileSource {
    /// Open a file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        let path = path
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Ok(FileSource { file, size, path })
    }

    /// Get file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    #[cfg(unix)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(&self.file, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(&self.file, buf, offset)
    }

    fn identity(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

/// Memory-mapped file source
pub struct MmapSource {
    map: Mmap,
    path: std::path::PathBuf,
}

impl MmapSource {
    /// Map a file read-only
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::open(&path)?;
        // SAFETY: the mapping is read-only and images are opened for reading;
        // concurrent truncation of the file by another process is not supported.
        let map = unsafe { Mmap::map(&file)? };
        let path = path
            .as_ref()
            .canonicalize()
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Ok(MmapSource { map, path })
    }
}

impl ByteSource for MmapSource {
    fn size(&self) -> u64 {
        self.map.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice_at(&self.map, offset, buf))
    }

    fn identity(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}

/// In-memory source, mostly useful for tests and embedded images
#[derive(Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
    label: Option<String>,
}

impl MemorySource {
    pub fn new(data: impl Into<Arc<[u8]>>) -> Self {
        MemorySource {
            data: data.into(),
            label: None,
        }
    }

    /// Attach a label that acts as the source identity
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl ByteSource for MemorySource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        Ok(copy_from_slice_at(&self.data, offset, buf))
    }

    fn identity(&self) -> Option<String> {
        self.label.clone()
    }
}

fn copy_from_slice_at(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let len = data.len() as u64;
    if offset >= len {
        return 0;
    }
    let start = offset as usize;
    let count = buf.len().min(data.len() - start);
    buf[..count].copy_from_slice(&data[start..start + count]);
    count
}
