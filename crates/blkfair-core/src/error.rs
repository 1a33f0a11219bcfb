//! Error types for blkfair-core.

use thiserror::Error;

/// Result type alias using the library's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for blkfair-core.
///
/// The scheduling fast paths are infallible by design: invariant
/// violations are asserted in debug builds and absorbed by forcing an
/// expiry in release builds. Errors surface only at the boundary —
/// unknown handles, attribute parsing, and the backpressure protocol.
#[derive(Error, Debug)]
pub enum Error {
    /// A request id did not resolve to a live request.
    #[error("unknown request {0}")]
    UnknownRequest(u32),

    /// A group id did not resolve to a live group.
    #[error("unknown group {0}")]
    UnknownGroup(u32),

    /// A producer id has no registered context.
    #[error("unknown producer {0}")]
    UnknownProducer(u32),

    /// A tunable attribute name is not part of the surface.
    #[error("unknown attribute {0:?}")]
    UnknownAttr(String),

    /// A tunable attribute value failed to parse as an integer.
    #[error("invalid value {value:?} for attribute {attr:?}")]
    InvalidAttr { attr: String, value: String },

    /// A raw I/O priority did not decode to a known class.
    #[error("bad raw ioprio {0:#x}")]
    BadIoPrio(u16),

    /// An operation was attempted on a scheduler that has been shut
    /// down.
    #[error("scheduler already exited")]
    Exited,
}
