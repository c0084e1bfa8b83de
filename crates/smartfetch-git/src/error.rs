//! Fetch error types.

use smartfetch_storage::StorageError;
use thiserror::Error;

/// Errors that can occur while fetching from a remote.
///
/// Every variant aborts the fetch. Refs and shallow metadata are only written
/// after the pack has been consumed completely, so none of these leave a ref
/// pointing at objects that were never stored.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The remote sent something that does not follow the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The response ended before a required terminator.
    #[error("truncated pack: {0}")]
    TruncatedPack(String),

    /// The caller asked for something that cannot be sent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The transport failed or the server answered with an error status.
    #[error("network failure: {0}")]
    NetworkFailure(String),

    /// The server reported an error on the side-band or with an `ERR` line.
    #[error("remote error: {0}")]
    RemoteError(String),

    /// Shallow results were requested before the pack stream was exhausted.
    #[error("pack stream has not been fully consumed")]
    IngestNotFinished,

    /// Object or ref store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl FetchError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation(message.into())
    }

    pub(crate) fn truncated(message: impl Into<String>) -> Self {
        Self::TruncatedPack(message.into())
    }

    pub(crate) fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Maps an I/O error from the response body.
    ///
    /// An unexpected end of file means the server stopped sending; anything
    /// else is a transport problem.
    pub(crate) fn from_read(err: std::io::Error, context: &str) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::TruncatedPack(format!("stream ended {context}"))
        } else {
            Self::NetworkFailure(format!("{context}: {err}"))
        }
    }
}
