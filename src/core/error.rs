use thiserror::Error;

#[derive(Error, Debug)]
pub enum QcowError {
    #[error("Invalid image format: {0}")]
    InvalidFormat(String),

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported image feature: {0}")]
    UnsupportedFeature(String),

    #[error("Inconsistent header metadata: {0}")]
    InconsistentMetadata(String),

    #[error("Corrupt lookup table: {0}")]
    CorruptMetadata(String),

    #[error("Offset {offset} is beyond the addressable range ({limit} bytes)")]
    OffsetOutOfBounds { offset: u64, limit: u64 },

    #[error("Truncated image: expected {expected} bytes at offset {offset}, got {actual}")]
    TruncatedImage {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Decompression failed: {0}")]
    DecompressionError(String),

    #[error("Cluster defers to a backing image but none is attached")]
    BackingFileUnavailable,

    #[error("Cyclic or unbounded backing chain: {0}")]
    CyclicBackingChain(String),

    #[error("Invalid seek: {0}")]
    InvalidSeek(String),

    #[error("Image handle is not open")]
    NotOpen,

    #[error("Image handle is already open")]
    AlreadyOpen,

    #[error("Image handle is already closed")]
    AlreadyClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

impl QcowError {
    /// Whether the error is scoped to a single read call.
    ///
    /// Per-read errors leave the handle open and usable for other offsets;
    /// everything else is either a structural failure at open time or a
    /// misuse of the handle state machine.
    pub fn is_per_read(&self) -> bool {
        matches!(
            self,
            QcowError::CorruptMetadata(_)
                | QcowError::OffsetOutOfBounds { .. }
                | QcowError::TruncatedImage { .. }
                | QcowError::DecompressionError(_)
                | QcowError::BackingFileUnavailable
                | QcowError::Io(_)
        )
    }
}

impl From<QcowError> for std::io::Error {
    fn from(err: QcowError) -> Self {
        match err {
            QcowError::Io(e) => e,
            QcowError::InvalidSeek(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            QcowError::TruncatedImage { .. } => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err)
            }
            QcowError::NotOpen | QcowError::AlreadyClosed => {
                std::io::Error::new(std::io::ErrorKind::NotConnected, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, QcowError>;
