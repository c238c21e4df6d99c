//! Error kinds surfaced by the store.
//!
//! Signal-interrupted syscalls are retried inside `fdio` and never
//! reach this type.
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A page mapping could not be acquired; the requesting operation
    /// published no partial state.
    #[error("chunk pool exhausted: page mapping failed")]
    ResourceExhausted,

    /// Unexpected EOF or any other non-retryable I/O failure.  The
    /// affected descriptor stays open for the caller to close.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The 16-byte size header was short, or the declared dimensions
    /// overflow the supported byte range.
    #[error("invalid matrix header")]
    InvalidHeader,

    /// The operation needs a backing file but none is bound.
    #[error("matrix has no backing file")]
    NoBackingFile,
}

pub type Result<T> = std::result::Result<T, Error>;
