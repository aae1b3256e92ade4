use std::io;
use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in RTP/RTCP handling
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid argument passed by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The packet cannot be a valid RTP/RTCP packet
    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    /// Not enough bytes for the structure being decoded
    #[error("buffer too small: required {required}, available {available}")]
    BufferTooSmall {
        /// Bytes the decoder needed
        required: usize,
        /// Bytes that were available
        available: usize,
    },

    /// The requested transport protocol is not supported
    #[error("transport protocol not supported")]
    ProtocolUnsupported,

    /// No local port pair could be bound in the requested range
    #[error("no usable local address/port")]
    AddressUnavailable,

    /// The endpoint has no socket or peer for the operation
    #[error("not connected")]
    NotConnected,

    /// Failure on the underlying RTSP connection (interleaved transport)
    #[error("rtsp transport: {0}")]
    Rtsp(#[from] rmedia_rtsp_core::Error),

    /// Input/output error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
