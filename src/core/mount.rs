//! Shared, lock-protected handle for exposing an image as a single file
//!
//! A mounted image appears as one virtual file named [`MOUNTED_FILE_NAME`].
//! Callers on different threads read through the same [`QcowFile`]; each
//! positioned read performs its seek and read under one lock acquisition so
//! concurrent readers never observe each other's cursor.

use crate::error::Result;
use crate::file::{QcowFile, Whence};
use crate::io::FileSource;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Name of the single file a mounted image exposes
pub const MOUNTED_FILE_NAME: &str = "qcow1";

/// Thread-safe wrapper around an open image
#[derive(Clone)]
pub struct MountHandle {
    inner: Arc<Mutex<QcowFile>>,
    input_path: Option<PathBuf>,
}

impl MountHandle {
    /// Wrap an already opened image
    pub fn new(file: QcowFile) -> Self {
        MountHandle {
            inner: Arc::new(Mutex::new(file)),
            input_path: None,
        }
    }

    /// Open the image at `path` and wrap it
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = FileSource::open(&path)?;
        let input_path = source.path().to_path_buf();
        let file = QcowFile::open_source(source)?;

        info!("Mounted {:?} as {}", input_path, MOUNTED_FILE_NAME);
        Ok(MountHandle {
            inner: Arc::new(Mutex::new(file)),
            input_path: Some(input_path),
        })
    }

    /// Name of the exposed file
    pub fn file_name(&self) -> &'static str {
        MOUNTED_FILE_NAME
    }

    /// Path of the image this handle was opened from, if any
    pub fn input_file_name(&self) -> Option<&Path> {
        self.input_path.as_deref()
    }

    pub fn media_size(&self) -> Result<u64> {
        self.inner.lock().media_size()
    }

    /// Read up to `size` bytes at `offset`
    ///
    /// Seeks the shared handle and reads while holding the lock, leaving the
    /// cursor just past the returned bytes.
    pub fn read_buffer_at_offset(&self, size: u64, offset: u64) -> Result<Vec<u8>> {
        let mut file = self.inner.lock();
        let target = i64::try_from(offset).map_err(|_| {
            crate::error::QcowError::InvalidSeek(format!("offset {} exceeds i64::MAX", offset))
        })?;
        file.seek(target, Whence::Set)?;
        let data = file.read(size)?;
        debug!(
            "Mounted read of {} bytes at 0x{:x} returned {}",
            size,
            offset,
            data.len()
        );
        Ok(data)
    }

    /// Close the underlying image; later reads fail with `AlreadyClosed`
    pub fn close(&self) -> Result<()> {
        self.inner.lock().close()
    }
}
