//! Error conversion utilities for the engine boundary.

use super::raw::{
    Status, UV_EADDRINUSE, UV_EALREADY, UV_EBADF, UV_EBUSY, UV_ECANCELED, UV_ECONNREFUSED,
    UV_ECONNRESET, UV_EINVAL, UV_EISCONN, UV_ENOMEM, UV_ENOTCONN, UV_ENOTSUP, UV_EOF, UV_EPIPE,
    UV_OK,
};
use crate::error::Error;

/// Convert a negative engine status to a Rust error.
pub fn error_from_status(code: Status) -> Error {
    match code {
        UV_EBADF => Error::InvalidHandle,
        UV_EINVAL => Error::InvalidArgument("rejected by engine".to_string()),
        UV_EOF => Error::Eof,
        UV_EPIPE => Error::BrokenPipe,
        UV_ECONNREFUSED => Error::ConnectionRefused,
        UV_ECONNRESET => Error::ConnectionReset,
        UV_ENOTCONN => Error::NotConnected,
        UV_EISCONN => Error::AlreadyConnected,
        UV_EALREADY => Error::ConnectInProgress,
        UV_EADDRINUSE => Error::AddressInUse,
        UV_ECANCELED => Error::Cancelled,
        UV_EBUSY => Error::Busy,
        UV_ENOTSUP => Error::NotSupported,
        UV_ENOMEM => Error::OutOfMemory,
        _ => Error::Native { code },
    }
}

/// Check a status code and convert to Result.
pub fn check_status(code: Status) -> crate::Result<()> {
    if code == UV_OK {
        Ok(())
    } else {
        Err(error_from_status(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffi::UV_ENOENT;

    #[test]
    fn test_ok_status() {
        assert!(check_status(UV_OK).is_ok());
    }

    #[test]
    fn test_status_round_trip_through_code() {
        for code in [
            UV_EBADF,
            UV_EINVAL,
            UV_EOF,
            UV_EPIPE,
            UV_ECONNREFUSED,
            UV_ECONNRESET,
            UV_ENOTCONN,
            UV_EISCONN,
            UV_EALREADY,
            UV_EADDRINUSE,
            UV_ECANCELED,
            UV_EBUSY,
            UV_ENOTSUP,
            UV_ENOMEM,
            UV_ENOENT,
        ] {
            let err = check_status(code).unwrap_err();
            assert_eq!(err.code(), code, "{err}");
        }
    }

    #[test]
    fn test_unknown_status_is_native() {
        let err = error_from_status(-9999);
        assert!(matches!(err, Error::Native { code: -9999 }));
    }
}
