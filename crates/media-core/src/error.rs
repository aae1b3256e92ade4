use thiserror::Error;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Jitter buffer errors.
///
/// [`Error::Late`], [`Error::Duplicate`] and [`Error::NotReady`] are
/// ordinary control signals of a running buffer, not failures; they are
/// surfaced to the caller and counted in the statistics.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument passed by the caller
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The packet arrived too late to be enqueued
    #[error("packet too late")]
    Late,

    /// A packet with this sequence number is already buffered
    #[error("duplicate packet")]
    Duplicate,

    /// Nothing to play out: still priming, underflow, or growing
    /// during silence
    #[error("no frame available")]
    NotReady,
}
