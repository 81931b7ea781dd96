//! Error types for mp4append-media.

use std::io;
use thiserror::Error;

/// Result type for mp4append-media operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mp4append-media operations.
///
/// Every variant is fatal to the invocation that produced it. Nothing is
/// retried internally.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error occurred while reading a source or writing the destination.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Box bounds or sample tables are structurally inconsistent.
    #[error("Malformed container: {0}")]
    MalformedContainer(String),

    /// Sources cannot be concatenated because their frame geometry differs
    /// (or cannot be inferred at all).
    #[error("Size mismatch: {0}")]
    SizeMismatch(String),

    /// The input is well formed but describes something this tool refuses to do.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Create a malformed container error.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedContainer(msg.into())
    }

    /// Create a size mismatch error.
    pub fn size_mismatch(msg: impl Into<String>) -> Self {
        Self::SizeMismatch(msg.into())
    }

    /// Create an unsupported error.
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::malformed("stco has 3 entries, stsc implies 4");
        assert_eq!(
            err.to_string(),
            "Malformed container: stco has 3 entries, stsc implies 4"
        );

        let err = Error::size_mismatch("640x480 vs 1280x720");
        assert_eq!(err.to_string(), "Size mismatch: 640x480 vs 1280x720");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = io::Error::new(io::ErrorKind::UnexpectedEof, "short read");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
