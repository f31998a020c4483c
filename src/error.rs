//! Error taxonomy for the engine: config and cache failures abort init,
//! everything else surfaces to the VFS host as an errno-shaped error.

use std::io::ErrorKind;
use thiserror::Error;

/// Errors surfaced by image I/O operations.
#[derive(Error, Debug)]
pub enum IoError {
    /// Read started at or past the current image size. Not a failure: the
    /// caller reports however many bytes were already transferred.
    #[error("end of file")]
    Eof,

    /// The VFS host cancelled the request.
    #[error("operation interrupted")]
    Interrupted,

    /// Network-class transport failure after retries were exhausted.
    #[error("transport failed: {0}")]
    Transport(FetchError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<FetchError> for IoError {
    fn from(value: FetchError) -> Self {
        match value {
            FetchError::Interrupted => IoError::Interrupted,
            other => IoError::Transport(other),
        }
    }
}

impl IoError {
    /// Errno reported to the FUSE host.
    pub fn errno(&self) -> i32 {
        match self {
            IoError::Eof => 0,
            IoError::Interrupted => libc::EINTR,
            IoError::Transport(_) | IoError::Io(_) => libc::EIO,
        }
    }
}

/// Transport failures, split by retry policy.
#[derive(Error, Debug)]
pub enum FetchError {
    /// DNS, connect, timeout, HTTP error status, transient read/write.
    /// Retried by the public fetch entry point.
    #[error("network error: {0}")]
    Network(String),

    /// Validator mismatch, short body, authentication rejected. Never
    /// retried.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    /// The cancellation predicate fired mid-request.
    #[error("operation interrupted")]
    Interrupted,
}

/// Init-time failures: a malformed configuration document or a corrupt
/// pristine cache directory. Both refuse to start the image.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("couldn't parse configuration: {0}")]
    Parse(String),

    #[error("invalid cache entry {0}")]
    InvalidCache(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Stream read failures.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Non-blocking read on an empty, still-open stream.
    #[error("stream data not ready")]
    WouldBlock,

    #[error("operation interrupted")]
    Interrupted,
}

impl From<IoError> for std::io::Error {
    fn from(value: IoError) -> Self {
        let kind = match &value {
            IoError::Eof => ErrorKind::UnexpectedEof,
            IoError::Interrupted => ErrorKind::Interrupted,
            IoError::Transport(_) | IoError::Io(_) => ErrorKind::Other,
        };
        std::io::Error::new(kind, value.to_string())
    }
}
