use std::io;
use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in RTSP protocol handling
#[derive(Error, Debug)]
pub enum Error {
    /// The input does not yet contain a complete message. The caller
    /// should keep the buffered bytes and retry once more data arrives.
    #[error("need more data")]
    NeedMoreData,

    /// The input can never become a valid message
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The per-connection input buffer exceeded its cap
    #[error("input buffer overflow")]
    Overflow,

    /// The connection is closed or was never established
    #[error("not connected")]
    NotConnected,

    /// Timed out waiting for the peer
    #[error("timed out")]
    Timeout,

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Invalid argument passed by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Input/output error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for [`Error::NeedMoreData`], the only decode error that keeps
    /// the connection alive.
    pub fn is_need_more_data(&self) -> bool {
        matches!(self, Error::NeedMoreData)
    }
}
