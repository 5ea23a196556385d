use crate::compression::CompressionKind;
use crate::error::{QcowError, Result};
use crate::io::ByteSource;
use byteorder::{BigEndian, ReadBytesExt};
use std::io::Cursor;

pub const MAGIC: [u8; 4] = *b"QFI\xfb";

/// Bytes fetched from the start of the image to decode any header version
pub const HEADER_READ_SIZE: usize = 112;

pub const QCOW1_HEADER_SIZE: usize = 48;
pub const QCOW2_HEADER_SIZE: usize = 72;
pub const QCOW3_HEADER_SIZE: usize = 104;

pub const MIN_CLUSTER_BITS: u32 = 9;
pub const MAX_CLUSTER_BITS: u32 = 21;
pub const QCOW1_MAX_CLUSTER_BITS: u32 = 16;
pub const QCOW1_MIN_L2_BITS: u32 = 6;
pub const QCOW1_MAX_L2_BITS: u32 = 13;

/// Largest accepted L1 table (32 MiB of entries)
pub const MAX_L1_ENTRIES: u64 = 4 * 1024 * 1024;
pub const MAX_BACKING_FILE_NAME: u32 = 1023;

/// Largest accepted virtual disk size; keeps signed seek arithmetic in range
pub const MAX_MEDIA_SIZE: u64 = i64::MAX as u64;

pub const INCOMPAT_DIRTY: u64 = 1 << 0;
pub const INCOMPAT_CORRUPT: u64 = 1 << 1;
pub const INCOMPAT_EXTERNAL_DATA: u64 = 1 << 2;
pub const INCOMPAT_COMPRESSION: u64 = 1 << 3;
pub const INCOMPAT_EXTENDED_L2: u64 = 1 << 4;

const INCOMPAT_KNOWN: u64 = INCOMPAT_DIRTY
    | INCOMPAT_CORRUPT
    | INCOMPAT_EXTERNAL_DATA
    | INCOMPAT_COMPRESSION
    | INCOMPAT_EXTENDED_L2;

/// Decoded QCOW image header
///
/// Fields cover versions 1 through 3. Version 1 images have no L1 size on
/// disk, so `l1_table_entries` is derived from the media size for them.
/// Created once at open and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageHeader {
    /// Format version (1, 2 or 3)
    pub version: u32,

    /// log2 of the cluster size
    pub cluster_bits: u32,

    /// log2 of the number of entries per L2 table
    pub l2_bits: u32,

    pub l1_table_offset: u64,
    pub l1_table_entries: u32,

    /// Logical size of the virtual disk in bytes
    pub virtual_disk_size: u64,

    pub compression_kind: CompressionKind,

    pub backing_file_offset: u64,
    pub backing_file_size: u32,

    /// Raw backing file name; resolving it to an image is up to the caller
    pub backing_file_reference: Option<String>,

    pub crypt_method: u32,
    pub number_of_snapshots: u32,

    pub incompatible_features: u64,
    pub compatible_features: u64,
    pub autoclear_features: u64,
    pub header_length: u32,
}

impl ImageHeader {
    /// Read, decode and validate the header of an image
    pub fn parse(source: &dyn ByteSource) -> Result<Self> {
        let bytes = source.read_vec_at(0, HEADER_READ_SIZE)?;
        let mut header = Self::from_bytes(&bytes)?;
        header.validate_layout(source.size())?;

        if header.has_backing_file() {
            let name = source.read_vec_at(
                header.backing_file_offset,
                header.backing_file_size as usize,
            )?;
            header.backing_file_reference = Some(String::from_utf8_lossy(&name).into_owned());
        }

        Ok(header)
    }

    /// Decode header fields and validate them in isolation
    ///
    /// Checks that need the size of the byte source are done separately by
    /// [`ImageHeader::validate_layout`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(QcowError::InvalidFormat(format!(
                "image too small for a header ({} bytes)",
                bytes.len()
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(QcowError::InvalidFormat(format!(
                "bad magic {:02x?}",
                &bytes[0..4]
            )));
        }

        let mut cursor = Cursor::new(bytes);
        cursor.set_position(4);
        let version = cursor.read_u32::<BigEndian>()?;

        let header = match version {
            1 => Self::decode_v1(bytes)?,
            2 | 3 => Self::decode_v2(bytes, version)?,
            other => return Err(QcowError::UnsupportedVersion(other)),
        };

        header.validate()?;
        Ok(header)
    }

    fn decode_v1(bytes: &[u8]) -> Result<Self> {
        require_len(bytes, QCOW1_HEADER_SIZE, 1)?;
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(8);

        let backing_file_offset = cursor.read_u64::<BigEndian>()?;
        let backing_file_size = cursor.read_u32::<BigEndian>()?;
        let _mtime = cursor.read_u32::<BigEndian>()?;
        let virtual_disk_size = cursor.read_u64::<BigEndian>()?;
        let cluster_bits = u32::from(cursor.read_u8()?);
        let l2_bits = u32::from(cursor.read_u8()?);
        let _padding = cursor.read_u16::<BigEndian>()?;
        let crypt_method = cursor.read_u32::<BigEndian>()?;
        let l1_table_offset = cursor.read_u64::<BigEndian>()?;

        if !(MIN_CLUSTER_BITS..=QCOW1_MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(QcowError::InconsistentMetadata(format!(
                "cluster bits {} outside [{}, {}]",
                cluster_bits, MIN_CLUSTER_BITS, QCOW1_MAX_CLUSTER_BITS
            )));
        }
        if !(QCOW1_MIN_L2_BITS..=QCOW1_MAX_L2_BITS).contains(&l2_bits) {
            return Err(QcowError::InconsistentMetadata(format!(
                "L2 bits {} outside [{}, {}]",
                l2_bits, QCOW1_MIN_L2_BITS, QCOW1_MAX_L2_BITS
            )));
        }

        // Version 1 sizes the L1 table to exactly cover the media.
        let l1_entries = virtual_disk_size.div_ceil(1u64 << (cluster_bits + l2_bits));
        if l1_entries > MAX_L1_ENTRIES {
            return Err(QcowError::InconsistentMetadata(format!(
                "L1 table of {} entries exceeds limit {}",
                l1_entries, MAX_L1_ENTRIES
            )));
        }

        Ok(ImageHeader {
            version: 1,
            cluster_bits,
            l2_bits,
            l1_table_offset,
            l1_table_entries: l1_entries as u32,
            virtual_disk_size,
            compression_kind: CompressionKind::Zlib,
            backing_file_offset,
            backing_file_size,
            backing_file_reference: None,
            crypt_method,
            number_of_snapshots: 0,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            header_length: QCOW1_HEADER_SIZE as u32,
        })
    }

    fn decode_v2(bytes: &[u8], version: u32) -> Result<Self> {
        require_len(bytes, QCOW2_HEADER_SIZE, version)?;
        let mut cursor = Cursor::new(bytes);
        cursor.set_position(8);

        let backing_file_offset = cursor.read_u64::<BigEndian>()?;
        let backing_file_size = cursor.read_u32::<BigEndian>()?;
        let cluster_bits = cursor.read_u32::<BigEndian>()?;
        let virtual_disk_size = cursor.read_u64::<BigEndian>()?;
        let crypt_method = cursor.read_u32::<BigEndian>()?;
        let l1_table_entries = cursor.read_u32::<BigEndian>()?;
        let l1_table_offset = cursor.read_u64::<BigEndian>()?;
        let _refcount_table_offset = cursor.read_u64::<BigEndian>()?;
        let _refcount_table_clusters = cursor.read_u32::<BigEndian>()?;
        let number_of_snapshots = cursor.read_u32::<BigEndian>()?;
        let _snapshots_offset = cursor.read_u64::<BigEndian>()?;

        if !(MIN_CLUSTER_BITS..=MAX_CLUSTER_BITS).contains(&cluster_bits) {
            return Err(QcowError::InconsistentMetadata(format!(
                "cluster bits {} outside [{}, {}]",
                cluster_bits, MIN_CLUSTER_BITS, MAX_CLUSTER_BITS
            )));
        }

        let mut header = ImageHeader {
            version,
            cluster_bits,
            l2_bits: cluster_bits - 3,
            l1_table_offset,
            l1_table_entries,
            virtual_disk_size,
            compression_kind: CompressionKind::Zlib,
            backing_file_offset,
            backing_file_size,
            backing_file_reference: None,
            crypt_method,
            number_of_snapshots,
            incompatible_features: 0,
            compatible_features: 0,
            autoclear_features: 0,
            header_length: QCOW2_HEADER_SIZE as u32,
        };

        if version == 3 {
            require_len(bytes, QCOW3_HEADER_SIZE, version)?;
            header.incompatible_features = cursor.read_u64::<BigEndian>()?;
            header.compatible_features = cursor.read_u64::<BigEndian>()?;
            header.autoclear_features = cursor.read_u64::<BigEndian>()?;
            let _refcount_order = cursor.read_u32::<BigEndian>()?;
            header.header_length = cursor.read_u32::<BigEndian>()?;

            if (header.header_length as usize) < QCOW3_HEADER_SIZE {
                return Err(QcowError::InvalidFormat(format!(
                    "version 3 header length {} below minimum {}",
                    header.header_length, QCOW3_HEADER_SIZE
                )));
            }
            header.compression_kind = decode_compression_type(&mut cursor, &header)?;
        }

        Ok(header)
    }

    fn validate(&self) -> Result<()> {
        if self.virtual_disk_size > MAX_MEDIA_SIZE {
            return Err(QcowError::InconsistentMetadata(format!(
                "media size {} exceeds limit {}",
                self.virtual_disk_size, MAX_MEDIA_SIZE
            )));
        }

        if self.crypt_method != 0 {
            return Err(QcowError::UnsupportedFeature(format!(
                "encrypted image (crypt method {})",
                self.crypt_method
            )));
        }

        let unknown = self.incompatible_features & !INCOMPAT_KNOWN;
        if unknown != 0 {
            return Err(QcowError::UnsupportedFeature(format!(
                "unknown incompatible feature bits 0x{:x}",
                unknown
            )));
        }
        if self.incompatible_features & INCOMPAT_EXTERNAL_DATA != 0 {
            return Err(QcowError::UnsupportedFeature(
                "external data file".to_string(),
            ));
        }
        if self.incompatible_features & INCOMPAT_EXTENDED_L2 != 0 {
            return Err(QcowError::UnsupportedFeature(
                "extended L2 entries".to_string(),
            ));
        }

        if u64::from(self.l1_table_entries) > MAX_L1_ENTRIES {
            return Err(QcowError::InconsistentMetadata(format!(
                "L1 table of {} entries exceeds limit {}",
                self.l1_table_entries, MAX_L1_ENTRIES
            )));
        }
        let required = self.l1_entries_required();
        if u64::from(self.l1_table_entries) < required {
            return Err(QcowError::InconsistentMetadata(format!(
                "L1 table has {} entries but media size {} needs {}",
                self.l1_table_entries, self.virtual_disk_size, required
            )));
        }

        if self.backing_file_offset != 0 && self.backing_file_size > MAX_BACKING_FILE_NAME {
            return Err(QcowError::InconsistentMetadata(format!(
                "backing file name length {} exceeds {}",
                self.backing_file_size, MAX_BACKING_FILE_NAME
            )));
        }

        Ok(())
    }

    /// Validate table and name locations against the byte source size
    pub fn validate_layout(&self, source_size: u64) -> Result<()> {
        if self.version >= 2 && self.l1_table_offset % self.cluster_size() != 0 {
            return Err(QcowError::InconsistentMetadata(format!(
                "L1 table offset 0x{:x} is not cluster aligned",
                self.l1_table_offset
            )));
        }

        if self.l1_table_entries > 0 {
            check_extent(source_size, self.l1_table_offset, self.l1_table_bytes())?;
        }

        if self.has_backing_file() {
            check_extent(
                source_size,
                self.backing_file_offset,
                u64::from(self.backing_file_size),
            )?;
        }

        Ok(())
    }

    pub fn cluster_size(&self) -> u64 {
        1u64 << self.cluster_bits
    }

    pub fn l2_entries_per_table(&self) -> u64 {
        1u64 << self.l2_bits
    }

    /// Size in bytes of one L2 table on disk
    pub fn l2_table_bytes(&self) -> u64 {
        self.l2_entries_per_table() * 8
    }

    pub fn l1_table_bytes(&self) -> u64 {
        u64::from(self.l1_table_entries) * 8
    }

    /// Minimum number of L1 entries needed to address the whole media
    pub fn l1_entries_required(&self) -> u64 {
        let span = self.cluster_size() << self.l2_bits;
        self.virtual_disk_size.div_ceil(span)
    }

    pub fn has_backing_file(&self) -> bool {
        self.backing_file_offset != 0 && self.backing_file_size != 0
    }

    pub fn encrypted(&self) -> bool {
        self.crypt_method != 0
    }

    pub fn is_dirty(&self) -> bool {
        self.incompatible_features & INCOMPAT_DIRTY != 0
    }

    pub fn is_marked_corrupt(&self) -> bool {
        self.incompatible_features & INCOMPAT_CORRUPT != 0
    }
}

fn decode_compression_type(
    cursor: &mut Cursor<&[u8]>,
    header: &ImageHeader,
) -> Result<CompressionKind> {
    let declared = header.incompatible_features & INCOMPAT_COMPRESSION != 0;

    if header.header_length as usize <= QCOW3_HEADER_SIZE {
        if declared {
            return Err(QcowError::InvalidFormat(
                "compression type bit set but header has no compression type field".to_string(),
            ));
        }
        return Ok(CompressionKind::Zlib);
    }

    let raw = cursor.read_u8().map_err(|_| {
        QcowError::InvalidFormat("header truncated before compression type".to_string())
    })?;
    let kind = CompressionKind::from_u8(raw).ok_or_else(|| {
        QcowError::UnsupportedFeature(format!("compression type {}", raw))
    })?;

    if kind != CompressionKind::Zlib && !declared {
        return Err(QcowError::InconsistentMetadata(format!(
            "compression type {} without the compression type feature bit",
            raw
        )));
    }
    Ok(kind)
}

fn require_len(bytes: &[u8], needed: usize, version: u32) -> Result<()> {
    if bytes.len() < needed {
        return Err(QcowError::InvalidFormat(format!(
            "version {} header needs {} bytes, image has {}",
            version,
            needed,
            bytes.len()
        )));
    }
    Ok(())
}

fn check_extent(source_size: u64, offset: u64, len: u64) -> Result<()> {
    let end = offset.checked_add(len).ok_or_else(|| {
        QcowError::InconsistentMetadata(format!("extent at 0x{:x} overflows", offset))
    })?;
    if end > source_size {
        return Err(QcowError::TruncatedImage {
            offset,
            expected: len,
            actual: source_size.saturating_sub(offset),
        });
    }
    Ok(())
}
