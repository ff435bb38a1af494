use std::io;
use thiserror::Error;

/// Reason a transfer attempt ended in `Failed`.
///
/// Variants carry rendered strings instead of source errors so the type
/// stays `Clone + PartialEq` and no `reqwest::Error`/`io::Error` crosses
/// the engine boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// DNS resolution or connection failure, including mid-body drops.
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    /// The attempt (or one of its network waits) exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Server answered with a status the executor cannot download from.
    #[error("HTTP status {0}")]
    HttpStatus(u16),

    /// Final file size disagrees with the server-declared total.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Filesystem failure while opening, seeking or writing.
    #[error("I/O error: {0}")]
    Io(String),

    /// Range negotiation broke down: a 206 for the wrong slice, or a 416
    /// that the no-Range fallback could not recover from.
    #[error("invalid range response: {0}")]
    InvalidRangeResponse(String),
}

impl TransferError {
    /// Classify a `reqwest` failure into the taxonomy.
    pub fn from_http_error(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransferError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            TransferError::HttpStatus(status.as_u16())
        } else {
            TransferError::NetworkUnreachable(err.to_string())
        }
    }

    /// Creates a `TransferError::Io` from an I/O error.
    pub fn from_io_error(err: io::Error) -> Self {
        TransferError::Io(err.to_string())
    }
}

/// Errors surfaced by the manager handle API.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No registered task matches the given URL or file name.
    #[error("no download found for \"{0}\"")]
    TaskNotFound(String),

    /// The manager task has shut down and can no longer take commands.
    #[error("download manager is not running")]
    ManagerClosed,

    /// Filesystem failure outside a transfer attempt.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
