//! Error types for the entire application.
//!
//! We use `thiserror` for library-style errors with custom types,
//! and `anyhow` for application-level error propagation in main.rs.

use thiserror::Error;

/// Errors that can occur while decoding a raw trace or stack side-table
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("I/O error reading trace: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad magic number: expected {expected:?}, found {found:?}")]
    BadMagic { expected: [u8; 4], found: [u8; 4] },

    #[error("unsupported trace format version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated header: {0}")]
    TruncatedHeader(&'static str),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("corrupt record in chunk {chunk}: {reason}")]
    CorruptRecord { chunk: usize, reason: String },

    #[error("invalid stack side-table: {0}")]
    StackTable(#[from] serde_json::Error),
}

/// Errors that can occur while building or persisting a digest cache.
///
/// A missing or stale digest is never an error; queries silently fall
/// back to a rebuild or a full replay.
#[derive(Error, Debug)]
pub enum DigestError {
    #[error("I/O error writing digest: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to persist digest atomically: {0}")]
    Persist(#[from] tempfile::PersistError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Errors that can occur when answering point-in-time queries
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("time {requested} is outside the trace range [{start}, {end}]")]
    OutOfRange {
        requested: f64,
        start: f64,
        end: f64,
    },

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Errors that can occur when writing export files
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("failed to write file: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("failed to serialize JSON: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("invalid output path: {0}")]
    InvalidPath(String),
}
