//! Error types for the ULog capture sink.
//!
//! Every failure the sink can hit is session-local: none of these errors
//! propagate out of the router's dispatch into the process. The variants
//! mirror the recovery policy — an `IoOpen` fails `start()` outright, an
//! `IoWrite` drops one record and the session continues, an `Overflow` of
//! the partial spill area ends writes for the session.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Which fixed-size buffer overflowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// The record staging area (reassembled ULog byte stream).
    Staging,
    /// The partial-write spill area.
    Partial,
}

impl std::fmt::Display for BufferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BufferKind::Staging => write!(f, "staging"),
            BufferKind::Partial => write!(f, "partial"),
        }
    }
}

/// Main error type for ULog capture operations.
#[derive(Error, Debug)]
pub enum SinkError {
    /// The output log file could not be created or opened.
    #[error("Failed to open log file '{path}': {source}")]
    IoOpen {
        /// Path of the file that failed to open.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A file write failed with something other than `WouldBlock`.
    #[error("Log file write error: {source}")]
    IoWrite {
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A fixed-capacity buffer would have exceeded its bound.
    #[error("{buffer} buffer overflow: {needed} bytes needed, capacity {capacity}")]
    Overflow {
        /// Which buffer overflowed.
        buffer: BufferKind,
        /// Bytes the operation required.
        needed: usize,
        /// The buffer's fixed capacity.
        capacity: usize,
    },

    /// The first fragment did not carry the ULog magic.
    #[error("ULog header magic mismatch")]
    BadMagic,

    /// Malformed packet or fragment (length mismatches, bad offsets).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Operation not implemented by this endpoint.
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// Configuration errors (parsing, validation, missing files).
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Type alias for Results that use SinkError.
pub type Result<T> = std::result::Result<T, SinkError>;

impl SinkError {
    /// Create a new open error for the given path.
    pub fn io_open(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::IoOpen {
            path: path.into(),
            source,
        }
    }

    /// Create a new write error.
    pub fn io_write(source: io::Error) -> Self {
        Self::IoWrite { source }
    }

    /// Create a new overflow error.
    pub fn overflow(buffer: BufferKind, needed: usize, capacity: usize) -> Self {
        Self::Overflow {
            buffer,
            needed,
            capacity,
        }
    }

    /// Create a new protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overflow_display() {
        let err = SinkError::overflow(BufferKind::Partial, 2002, 1024);
        let text = err.to_string();
        assert!(text.contains("partial"));
        assert!(text.contains("2002"));
        assert!(text.contains("1024"));
    }

    #[test]
    fn test_io_open_keeps_source() {
        let err = SinkError::io_open(
            "/nonexistent/logs",
            io::Error::new(io::ErrorKind::NotFound, "no such directory"),
        );
        assert!(std::error::Error::source(&err).is_some());
    }
}
