//! Error types for the uvstream crate.

use thiserror::Error;

use crate::ffi::{
    Status, UV_EADDRINUSE, UV_EALREADY, UV_EBADF, UV_EBUSY, UV_ECANCELED, UV_ECONNREFUSED,
    UV_ECONNRESET, UV_EINVAL, UV_EISCONN, UV_ENOMEM, UV_ENOTCONN, UV_ENOTSUP, UV_EOF, UV_EPIPE,
};
use crate::types::HandleType;

/// Result type alias for uvstream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for uvstream operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Handle is invalid, unknown to the engine, or already disposed.
    #[error("invalid handle")]
    InvalidHandle,

    /// Function argument is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A close request has already been issued for this handle.
    #[error("already closed")]
    AlreadyClosed,

    /// `accept` was called outside a connection or handle-reception callback.
    #[error("accept called outside a connection callback")]
    NotAccepting,

    /// A handle of the wrong transport kind was passed.
    #[error("incompatible transport: expected {expected:?}, got {found:?}")]
    IncompatibleTransport {
        /// Transport kind the operation needs.
        expected: HandleType,
        /// Transport kind it was given.
        found: HandleType,
    },

    /// The peer finished sending.
    #[error("end of stream")]
    Eof,

    /// Write side is shut down or the peer went away.
    #[error("broken pipe")]
    BrokenPipe,

    /// Nothing accepted the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The peer dropped the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The stream has no connection.
    #[error("not connected")]
    NotConnected,

    /// The stream is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// A connection attempt is already in progress.
    #[error("connection already in progress")]
    ConnectInProgress,

    /// Another stream is bound to the address.
    #[error("address in use")]
    AddressInUse,

    /// The request was cancelled by a close.
    #[error("cancelled")]
    Cancelled,

    /// The resource is busy, e.g. a loop that is already running.
    #[error("resource busy")]
    Busy,

    /// Operation not supported by this transport.
    #[error("operation not supported")]
    NotSupported,

    /// The engine could not allocate native state.
    #[error("out of memory")]
    OutOfMemory,

    /// Any other native status.
    #[error("native error {code}")]
    Native {
        /// Negative engine status.
        code: Status,
    },
}

impl Error {
    /// The negative engine status equivalent to this error.
    pub fn code(&self) -> Status {
        match self {
            Error::InvalidHandle | Error::AlreadyClosed => UV_EBADF,
            Error::InvalidArgument(_)
            | Error::NotAccepting
            | Error::IncompatibleTransport { .. } => UV_EINVAL,
            Error::Eof => UV_EOF,
            Error::BrokenPipe => UV_EPIPE,
            Error::ConnectionRefused => UV_ECONNREFUSED,
            Error::ConnectionReset => UV_ECONNRESET,
            Error::NotConnected => UV_ENOTCONN,
            Error::AlreadyConnected => UV_EISCONN,
            Error::ConnectInProgress => UV_EALREADY,
            Error::AddressInUse => UV_EADDRINUSE,
            Error::Cancelled => UV_ECANCELED,
            Error::Busy => UV_EBUSY,
            Error::NotSupported => UV_ENOTSUP,
            Error::OutOfMemory => UV_ENOMEM,
            Error::Native { code } => *code,
        }
    }

    /// Check if this is an end-of-stream marker.
    pub fn is_eof(&self) -> bool {
        matches!(self, Error::Eof)
    }

    /// Check if this is a cancelled error.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Check if this error means the handle can no longer be used.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::AlreadyClosed | Error::InvalidHandle)
    }
}
