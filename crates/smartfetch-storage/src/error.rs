//! Storage error types.

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A string could not be parsed as an object id.
    #[error("invalid object id: {0}")]
    InvalidObjectId(String),

    /// Raw object bytes are malformed.
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// A ref name or metadata key is not acceptable to the store.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Stored data failed to decompress.
    #[error("compression error: {0}")]
    Compression(String),

    /// The repository uses a layout this store cannot read.
    #[error("unsupported repository: {0}")]
    Unsupported(String),

    /// A stored object does not hash to its key.
    #[error("corruption detected: {0}")]
    Corruption(String),
}
