//! Utility modules for configuration and error handling.

pub mod config;
pub mod error;
pub mod si;

// Re-export commonly used error types for convenience
pub use error::{DigestError, FormatError, OutputError, QueryError};
