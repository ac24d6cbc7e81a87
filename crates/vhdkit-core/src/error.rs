//! vhdkit error types

use thiserror::Error;

/// The main error type for vhdkit operations
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error from the underlying byte source
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller passed an invalid value
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Expected magic bytes are absent
    #[error("Signature mismatch: {0}")]
    SignatureMismatch(String),

    /// Stored and computed checksums disagree
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Recognized but unsupported version, disk type, sector size or region
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Internal structural violation in the image
    #[error("Malformed image: {0}")]
    Malformed(String),

    /// Parent image identifier or filename could not be matched
    #[error("Parent mismatch: {0}")]
    ParentMismatch(String),

    /// Operation cancelled via the abort flag
    #[error("Operation aborted")]
    Aborted,
}

/// Result type alias for vhdkit operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid argument error
    pub fn argument(msg: impl Into<String>) -> Self {
        Error::Argument(msg.into())
    }

    /// Create a signature mismatch error
    pub fn signature_mismatch(msg: impl Into<String>) -> Self {
        Error::SignatureMismatch(msg.into())
    }

    /// Create a checksum mismatch error
    pub fn checksum_mismatch(msg: impl Into<String>) -> Self {
        Error::ChecksumMismatch(msg.into())
    }

    /// Create an unsupported format error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Error::UnsupportedFormat(msg.into())
    }

    /// Create a malformed image error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    /// Create a parent mismatch error
    pub fn parent_mismatch(msg: impl Into<String>) -> Self {
        Error::ParentMismatch(msg.into())
    }
}

impl From<Error> for std::io::Error {
    fn from(error: Error) -> Self {
        match error {
            Error::Io(inner) => inner,
            Error::Aborted => std::io::Error::new(std::io::ErrorKind::Interrupted, error),
            Error::Argument(_) => std::io::Error::new(std::io::ErrorKind::InvalidInput, error),
            _ => std::io::Error::new(std::io::ErrorKind::InvalidData, error),
        }
    }
}
