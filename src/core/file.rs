//! Read engine: the public handle over one QCOW image
//!
//! A [`QcowFile`] moves through `Unopened → Open → Closed`. Opening parses
//! the header and loads the L1 table eagerly, so an open handle always has
//! structurally sane metadata; individual clusters can still fail later and
//! such failures are confined to the read that hit them.
//!
//! Reads are split into cluster-aligned spans, each translated and
//! materialized separately, then assembled into one buffer. A failing read
//! returns no partial data and leaves the cursor where it was.

use crate::cluster::{BackingReader, ClusterReader, ClusterReaderStats};
use crate::compression::CompressionKind;
use crate::config::ReaderConfig;
use crate::error::{QcowError, Result};
use crate::header::ImageHeader;
use crate::io::{ByteSource, FileSource};
use crate::translator::{ClusterTranslator, TranslatorStats};
use std::io;
use std::path::Path;
use tracing::{info, warn};

/// Reference point for [`QcowFile::seek`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// From the start of the media
    Set,
    /// From the current cursor
    Current,
    /// From the end of the media
    End,
}

/// How an image is opened; only reading is supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
}

impl AccessMode {
    /// Parse an fopen-style mode string
    pub fn parse(mode: &str) -> Result<Self> {
        match mode {
            "r" | "rb" => Ok(AccessMode::Read),
            other => Err(QcowError::UnsupportedFeature(format!(
                "access mode '{}' (images are read-only)",
                other
            ))),
        }
    }
}

/// Per-handle cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStats {
    pub translator: TranslatorStats,
    pub clusters: ClusterReaderStats,
    pub backing_depth: usize,
}

struct OpenImage {
    source: Box<dyn ByteSource>,
    header: ImageHeader,
    translator: ClusterTranslator,
    reader: ClusterReader,
    backing: Option<Box<QcowFile>>,
    cursor: u64,
}

impl OpenImage {
    fn load(source: Box<dyn ByteSource>, config: &ReaderConfig) -> Result<Self> {
        let header = ImageHeader::parse(&*source)?;

        if header.is_dirty() {
            warn!("Image has the dirty bit set; refcounts may be stale");
        }
        if header.is_marked_corrupt() {
            warn!("Image is marked corrupt; reading anyway");
        }

        let translator = ClusterTranslator::new(&*source, &header, config.l2_cache_capacity)?;
        let reader = ClusterReader::new(
            header.cluster_size(),
            header.compression_kind,
            config.cluster_cache_capacity,
        );

        info!(
            "Opened QCOW v{} image: media size {} bytes, cluster size {} bytes, {} L1 entries{}",
            header.version,
            header.virtual_disk_size,
            header.cluster_size(),
            header.l1_table_entries,
            match header.backing_file_reference.as_deref() {
                Some(name) => format!(", backing file '{}'", name),
                None => String::new(),
            }
        );

        Ok(OpenImage {
            source,
            header,
            translator,
            reader,
            backing: None,
            cursor: 0,
        })
    }

    /// Read `size` bytes at `offset`, clamped to the end of the media
    fn read_range(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        let media_size = self.header.virtual_disk_size;
        if offset >= media_size || size == 0 {
            return Ok(Vec::new());
        }

        let len = size.min(media_size - offset);
        let len = usize::try_from(len).map_err(|_| QcowError::OffsetOutOfBounds {
            offset,
            limit: usize::MAX as u64,
        })?;

        let mut output = Vec::new();
        output.try_reserve_exact(len).map_err(|_| {
            QcowError::Io(io::Error::new(
                io::ErrorKind::OutOfMemory,
                format!("cannot allocate a {} byte read buffer", len),
            ))
        })?;

        let cluster_size = self.translator.cluster_size();
        let end = offset + len as u64;
        let mut position = offset;

        while position < end {
            let cluster_start = position & !(cluster_size - 1);
            let intra = (position - cluster_start) as usize;
            let span = (cluster_size - intra as u64).min(end - position) as usize;

            let location = self.translator.translate(&*self.source, position)?;
            let backing = self
                .backing
                .as_deref_mut()
                .map(|parent| parent as &mut dyn BackingReader);
            let cluster =
                self.reader
                    .materialize(location, &*self.source, backing, cluster_start)?;

            output.extend_from_slice(&cluster[intra..intra + span]);
            position += span as u64;
        }

        Ok(output)
    }

    fn backing_depth(&self) -> usize {
        self.backing
            .as_ref()
            .map_or(0, |parent| 1 + parent.backing_depth())
    }
}

enum HandleState {
    Unopened,
    Open(Box<OpenImage>),
    Closed,
}

/// Read-only handle on a QCOW image
///
/// # Examples
///
/// ```rust,no_run
/// use qcow_rs::{QcowFile, Whence};
///
/// # fn main() -> qcow_rs::Result<()> {
/// let mut image = QcowFile::open_path("disk.qcow2")?;
///
/// image.seek(-1024, Whence::End)?;
/// let tail = image.read(4096)?;
/// assert_eq!(tail.len(), 1024);
///
/// let boot_sector = image.read_at(0, 512)?;
/// image.close()?;
/// # Ok(())
/// # }
/// ```
pub struct QcowFile {
    state: HandleState,
    config: ReaderConfig,
}

impl QcowFile {
    /// Create an unopened handle with default configuration
    pub fn new() -> Self {
        Self::with_config(ReaderConfig::default())
    }

    pub fn with_config(config: ReaderConfig) -> Self {
        QcowFile {
            state: HandleState::Unopened,
            config,
        }
    }

    /// Open a byte source and return the ready handle
    pub fn open_source<S: ByteSource + 'static>(source: S) -> Result<Self> {
        let mut file = Self::new();
        file.open(source, AccessMode::Read)?;
        Ok(file)
    }

    /// Open an image file by path
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        info!("Opening image at {:?}", path.as_ref());
        Self::open_source(FileSource::open(path)?)
    }

    /// Parse the header and L1 table of `source` and move to the open state
    pub fn open<S: ByteSource + 'static>(&mut self, source: S, mode: AccessMode) -> Result<()> {
        match self.state {
            HandleState::Unopened => {}
            HandleState::Open(_) => return Err(QcowError::AlreadyOpen),
            HandleState::Closed => return Err(QcowError::AlreadyClosed),
        }
        match mode {
            AccessMode::Read => {}
        }
        self.config.validate()?;

        let image = OpenImage::load(Box::new(source), &self.config)?;
        self.state = HandleState::Open(Box::new(image));
        Ok(())
    }

    /// Release the source, caches and any attached backing chain
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, HandleState::Closed) {
            HandleState::Open(_) => {
                info!("Closed image handle");
                Ok(())
            }
            HandleState::Unopened => {
                self.state = HandleState::Unopened;
                Err(QcowError::NotOpen)
            }
            HandleState::Closed => Err(QcowError::AlreadyClosed),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, HandleState::Open(_))
    }

    fn image(&self) -> Result<&OpenImage> {
        match &self.state {
            HandleState::Open(image) => Ok(&**image),
            HandleState::Unopened => Err(QcowError::NotOpen),
            HandleState::Closed => Err(QcowError::AlreadyClosed),
        }
    }

    fn image_mut(&mut self) -> Result<&mut OpenImage> {
        match &mut self.state {
            HandleState::Open(image) => Ok(&mut **image),
            HandleState::Unopened => Err(QcowError::NotOpen),
            HandleState::Closed => Err(QcowError::AlreadyClosed),
        }
    }

    /// Move the cursor and return its new absolute position
    ///
    /// Seeking past the end of the media is allowed; subsequent reads
    /// return no data. A negative target is an error.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let image = self.image_mut()?;

        // Cursor and media size never exceed i64::MAX.
        let base = match whence {
            Whence::Set => 0i64,
            Whence::Current => image.cursor as i64,
            Whence::End => image.header.virtual_disk_size as i64,
        };
        let target = base.checked_add(offset).ok_or_else(|| {
            QcowError::InvalidSeek(format!("offset {} from {:?} overflows", offset, whence))
        })?;
        if target < 0 {
            return Err(QcowError::InvalidSeek(format!(
                "offset {} from {:?} resolves to negative position {}",
                offset, whence, target
            )));
        }

        image.cursor = target as u64;
        Ok(image.cursor)
    }

    /// Current cursor position
    pub fn tell(&self) -> Result<u64> {
        Ok(self.image()?.cursor)
    }

    /// Read up to `size` bytes at the cursor and advance it
    ///
    /// Returns fewer bytes than requested when the read crosses the end of
    /// the media, and an empty buffer when the cursor is at or beyond it.
    pub fn read(&mut self, size: u64) -> Result<Vec<u8>> {
        let image = self.image_mut()?;
        let data = image.read_range(image.cursor, size)?;
        image.cursor += data.len() as u64;
        Ok(data)
    }

    /// Read up to `size` bytes at `offset` without touching the cursor
    ///
    /// Clamps at the end of the media like [`QcowFile::read`]; callers detect
    /// a short read by comparing the returned length with `size`.
    pub fn read_at(&mut self, offset: u64, size: u64) -> Result<Vec<u8>> {
        self.image_mut()?.read_range(offset, size)
    }

    /// Logical size of the virtual disk
    pub fn media_size(&self) -> Result<u64> {
        Ok(self.image()?.header.virtual_disk_size)
    }

    pub fn header(&self) -> Result<&ImageHeader> {
        Ok(&self.image()?.header)
    }

    pub fn cluster_size(&self) -> Result<u64> {
        Ok(self.image()?.header.cluster_size())
    }

    pub fn format_version(&self) -> Result<u32> {
        Ok(self.image()?.header.version)
    }

    pub fn compression_kind(&self) -> Result<CompressionKind> {
        Ok(self.image()?.header.compression_kind)
    }

    pub fn number_of_snapshots(&self) -> Result<u32> {
        Ok(self.image()?.header.number_of_snapshots)
    }

    pub fn is_dirty(&self) -> Result<bool> {
        Ok(self.image()?.header.is_dirty())
    }

    /// Backing file name recorded in the header, for external resolution
    pub fn backing_file_reference(&self) -> Result<Option<&str>> {
        Ok(self.image()?.header.backing_file_reference.as_deref())
    }

    /// Attach an opened parent image that supplies unallocated clusters
    ///
    /// Fails with [`QcowError::CyclicBackingChain`] when the resulting chain
    /// would exceed the configured depth or revisit a byte source.
    pub fn set_backing(&mut self, parent: QcowFile) -> Result<()> {
        let max_depth = self.config.max_backing_depth;
        parent.image()?;
        let image = self.image_mut()?;

        let depth = 1 + parent.backing_depth();
        if depth > max_depth {
            return Err(QcowError::CyclicBackingChain(format!(
                "chain depth {} exceeds limit {}",
                depth, max_depth
            )));
        }

        let mut seen: Vec<String> = image.source.identity().into_iter().collect();
        for identity in parent.chain_identities() {
            if seen.contains(&identity) {
                return Err(QcowError::CyclicBackingChain(format!(
                    "'{}' appears twice in the chain",
                    identity
                )));
            }
            seen.push(identity);
        }

        if !image.header.has_backing_file() {
            warn!("Attaching a backing image to an image without a backing file reference");
        }
        info!("Attached backing image (chain depth {})", depth);
        image.backing = Some(Box::new(parent));
        Ok(())
    }

    /// Number of images below this one in the backing chain
    pub fn backing_depth(&self) -> usize {
        self.image().map_or(0, |image| image.backing_depth())
    }

    fn chain_identities(&self) -> Vec<String> {
        let mut identities = Vec::new();
        let mut current = self.image().ok();
        while let Some(image) = current {
            identities.extend(image.source.identity());
            current = image.backing.as_deref().and_then(|parent| parent.image().ok());
        }
        identities
    }

    pub fn stats(&self) -> Result<ImageStats> {
        let image = self.image()?;
        Ok(ImageStats {
            translator: image.translator.stats(),
            clusters: image.reader.stats(),
            backing_depth: image.backing_depth(),
        })
    }
}

impl Default for QcowFile {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingReader for QcowFile {
    fn read_backing(&mut self, logical_offset: u64, buf: &mut [u8]) -> Result<usize> {
        let data = self.read_at(logical_offset, buf.len() as u64)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Read for QcowFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = QcowFile::read(self, buf.len() as u64)?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }
}

impl io::Seek for QcowFile {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, whence) = match pos {
            io::SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset).map_err(|_| {
                    QcowError::InvalidSeek(format!("offset {} exceeds i64::MAX", offset))
                })?;
                (offset, Whence::Set)
            }
            io::SeekFrom::Current(offset) => (offset, Whence::Current),
            io::SeekFrom::End(offset) => (offset, Whence::End),
        };
        Ok(QcowFile::seek(self, offset, whence)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;

    /// Version 2 image with 512 byte clusters and no allocated L2 tables
    fn empty_image(media_size: u64) -> MemorySource {
        let l1_entries = media_size.div_ceil(512 * 64).max(1) as u32;
        let mut bytes = vec![0u8; 1024];
        bytes[0..4].copy_from_slice(b"QFI\xfb");
        bytes[4..8].copy_from_slice(&2u32.to_be_bytes());
        bytes[20..24].copy_from_slice(&9u32.to_be_bytes());
        bytes[24..32].copy_from_slice(&media_size.to_be_bytes());
        bytes[36..40].copy_from_slice(&l1_entries.to_be_bytes());
        bytes[40..48].copy_from_slice(&512u64.to_be_bytes());
        bytes.resize(512 + l1_entries as usize * 8, 0);
        MemorySource::new(bytes)
    }

    #[test]
    fn test_read_before_open() {
        let mut file = QcowFile::new();
        assert!(matches!(file.read(4096), Err(QcowError::NotOpen)));
        assert!(matches!(file.read_at(0, 1), Err(QcowError::NotOpen)));
        assert!(matches!(file.seek(0, Whence::Set), Err(QcowError::NotOpen)));
        assert!(matches!(file.tell(), Err(QcowError::NotOpen)));
        assert!(matches!(file.media_size(), Err(QcowError::NotOpen)));
        assert!(matches!(file.close(), Err(QcowError::NotOpen)));
        assert!(!file.is_open());
    }

    #[test]
    fn test_state_machine() {
        let mut file = QcowFile::new();
        file.open(empty_image(4096), AccessMode::Read).unwrap();
        assert!(file.is_open());
        assert!(matches!(
            file.open(empty_image(4096), AccessMode::Read),
            Err(QcowError::AlreadyOpen)
        ));

        file.close().unwrap();
        assert!(matches!(file.read(1), Err(QcowError::AlreadyClosed)));
        assert!(matches!(file.close(), Err(QcowError::AlreadyClosed)));
        assert!(matches!(
            file.open(empty_image(4096), AccessMode::Read),
            Err(QcowError::AlreadyClosed)
        ));
    }

    #[test]
    fn test_failed_open_stays_unopened() {
        let mut file = QcowFile::new();
        let result = file.open(MemorySource::new(b"not an image".to_vec()), AccessMode::Read);
        assert!(matches!(result, Err(QcowError::InvalidFormat(_))));
        assert!(matches!(file.read(1), Err(QcowError::NotOpen)));
    }

    #[test]
    fn test_access_mode() {
        assert_eq!(AccessMode::parse("r").unwrap(), AccessMode::Read);
        assert!(matches!(
            AccessMode::parse("w"),
            Err(QcowError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            AccessMode::parse("r+"),
            Err(QcowError::UnsupportedFeature(_))
        ));

        let mut file = QcowFile::new();
        file.open(empty_image(4096), AccessMode::parse("rb").unwrap())
            .unwrap();
        assert_eq!(file.read_at(0, 4096).unwrap().len(), 4096);
    }

    #[test]
    fn test_seek_arithmetic() {
        let mut file = QcowFile::open_source(empty_image(10_000)).unwrap();
        assert_eq!(file.seek(100, Whence::Set).unwrap(), 100);
        assert_eq!(file.seek(-50, Whence::Current).unwrap(), 50);
        assert_eq!(file.seek(-1, Whence::End).unwrap(), 9_999);
        assert_eq!(file.seek(5_000, Whence::End).unwrap(), 15_000);
        assert_eq!(file.tell().unwrap(), 15_000);

        assert!(matches!(
            file.seek(-20_000, Whence::End),
            Err(QcowError::InvalidSeek(_))
        ));
        assert!(matches!(
            file.seek(i64::MAX, Whence::Current),
            Err(QcowError::InvalidSeek(_))
        ));
        // A rejected seek leaves the cursor alone.
        assert_eq!(file.tell().unwrap(), 15_000);
    }

    #[test]
    fn test_sparse_reads_and_clamping() {
        let mut file = QcowFile::open_source(empty_image(10_000)).unwrap();
        assert_eq!(file.media_size().unwrap(), 10_000);

        let all = file.read_at(0, 10_000).unwrap();
        assert_eq!(all.len(), 10_000);
        assert!(all.iter().all(|&b| b == 0));

        assert_eq!(file.read_at(9_000, 4096).unwrap().len(), 1_000);
        assert!(file.read_at(10_000, 10).unwrap().is_empty());
        assert!(file.read_at(0, 0).unwrap().is_empty());

        file.seek(9_990, Whence::Set).unwrap();
        assert_eq!(file.read(100).unwrap().len(), 10);
        assert_eq!(file.tell().unwrap(), 10_000);
        assert!(file.read(100).unwrap().is_empty());
        assert_eq!(file.tell().unwrap(), 10_000);
    }

    #[test]
    fn test_std_io_traits() {
        use std::io::{Read, Seek, SeekFrom};

        let mut file = QcowFile::open_source(empty_image(3_000)).unwrap();
        Seek::seek(&mut file, SeekFrom::End(-1_000)).unwrap();
        let mut tail = Vec::new();
        file.read_to_end(&mut tail).unwrap();
        assert_eq!(tail.len(), 1_000);

        let err = Seek::seek(&mut file, SeekFrom::Current(-5_000)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_backing_chain_limits() {
        let config = ReaderConfig::builder().max_backing_depth(1).build().unwrap();

        let mut child = QcowFile::with_config(config);
        child
            .open(empty_image(4096).with_label("child"), AccessMode::Read)
            .unwrap();

        let mut parent = QcowFile::open_source(empty_image(4096).with_label("parent")).unwrap();
        let grandparent = QcowFile::open_source(empty_image(4096).with_label("gp")).unwrap();
        parent.set_backing(grandparent).unwrap();

        assert!(matches!(
            child.set_backing(parent),
            Err(QcowError::CyclicBackingChain(_))
        ));

        let looped = QcowFile::open_source(empty_image(4096).with_label("child")).unwrap();
        let mut child = QcowFile::open_source(empty_image(4096).with_label("child")).unwrap();
        assert!(matches!(
            child.set_backing(looped),
            Err(QcowError::CyclicBackingChain(_))
        ));
        assert!(matches!(
            child.set_backing(QcowFile::new()),
            Err(QcowError::NotOpen)
        ));
        assert_eq!(child.backing_depth(), 0);
    }
}
