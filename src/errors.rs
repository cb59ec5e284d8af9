//! Utilities dealing with error handling in this crate.

use failure::Fail;
use nix::errno::Errno;

/// Errors produced by this crate.
#[derive(Debug, Fail)]
pub enum Error {
    /// A malformed argument, e.g. a sampling group with zero or too many events.
    #[fail(display = "Invalid argument")]
    InvalidArgument,
    /// The host event table has no encoding for the requested event.
    #[fail(display = "Pre-defined event not available")]
    NoSuchEvent,
    /// The counter syscall failed after validation passed.
    #[fail(display = "Hardware event error - {}", _0)]
    HardwareEvent(#[cause] Errno),
    /// The kernel refused to open the counter.
    #[fail(display = "Permission denied")]
    PermissionDenied,
    /// The event pool is exhausted or a mapping could not be made.
    #[fail(display = "Insufficient memory")]
    OutOfMemory,
    /// Reserved for internal inconsistencies.
    #[fail(display = "Internal error")]
    Internal,
    /// Reserved for instruction trace decoding failures.
    #[fail(display = "Decoder error")]
    Decoder,
    /// Errors originating from calls to `std::io::*`.
    #[fail(display = "IO Error - {}", _0)]
    IO(#[cause] std::io::Error),
    /// Errors originating from calls to `libc` or other system utilties.
    #[fail(display = "System Error - {}", _0)]
    System(#[cause] nix::Error),
}

impl Error {
    /// Create a new instance of error from the `errno` variable.
    #[inline]
    pub fn from_errno() -> Self {
        Error::from_os_errno(Errno::last())
    }

    /// Classify an OS error returned while opening or driving a counter.
    pub fn from_os_errno(err: Errno) -> Self {
        match err {
            Errno::EPERM | Errno::EACCES => Error::PermissionDenied,
            Errno::ENOMEM => Error::OutOfMemory,
            e => Error::HardwareEvent(e),
        }
    }

    /// Stable integer code of the error, as exported to generated code.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument => -1,
            Error::OutOfMemory => -2,
            Error::NoSuchEvent => -3,
            Error::HardwareEvent(_) | Error::System(_) | Error::IO(_) => -4,
            Error::PermissionDenied => -5,
            Error::Internal => -6,
            Error::Decoder => -7,
        }
    }
}

macro_rules! error_from {
    ($et: ty => $cet: expr) => {
        impl From<$et> for Error {
            #[inline]
            fn from(err: $et) -> Self {
                $cet(err)
            }
        }
    };
}

error_from!(std::io::Error => Error::IO);
error_from!(nix::Error => Error::System);

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_classification() {
        assert!(matches!(
            Error::from_os_errno(Errno::EACCES),
            Error::PermissionDenied
        ));
        assert!(matches!(
            Error::from_os_errno(Errno::EPERM),
            Error::PermissionDenied
        ));
        assert!(matches!(
            Error::from_os_errno(Errno::ENOMEM),
            Error::OutOfMemory
        ));
        assert!(matches!(
            Error::from_os_errno(Errno::ENOENT),
            Error::HardwareEvent(Errno::ENOENT)
        ));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::InvalidArgument.code(), -1);
        assert_eq!(Error::OutOfMemory.code(), -2);
        assert_eq!(Error::NoSuchEvent.code(), -3);
        assert_eq!(Error::HardwareEvent(Errno::EIO).code(), -4);
        assert_eq!(Error::PermissionDenied.code(), -5);
        assert_eq!(format!("{}", Error::NoSuchEvent), "Pre-defined event not available");
    }
}
