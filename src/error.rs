//! Connection fault classification

use std::io;

/// A fault that retires a connection. There is no recovery: the owning loop
/// logs the error, cleans up any in-flight transfer, and exits.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// Send or receive on the byte stream failed with a non-disconnect error.
    #[error("transport error: {0}")]
    Transport(#[source] io::Error),

    /// The peer closed the stream. Clean only when the state machine was idle.
    #[error("peer disconnected")]
    Disconnected,

    /// Invalid framing or packet bytes: bad magic, out-of-range length,
    /// unknown tag, truncated or over-long payload.
    #[error("malformed stream: {0}")]
    Malformed(String),

    /// Legal bytes, illegal meaning: packet not allowed in the current state,
    /// path traversal, size overrun, integrity-check failure.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Local filesystem operation failed.
    #[error("{context}: {source}")]
    File {
        context: String,
        #[source]
        source: io::Error,
    },

    /// zstd compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(#[source] io::Error),
}

impl TransferError {
    pub fn malformed(what: impl Into<String>) -> Self {
        TransferError::Malformed(what.into())
    }

    pub fn protocol(what: impl Into<String>) -> Self {
        TransferError::Protocol(what.into())
    }

    pub fn file(context: impl Into<String>, source: io::Error) -> Self {
        TransferError::File {
            context: context.into(),
            source,
        }
    }
}
