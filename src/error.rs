//! Error handling utils.
//!
//! Every blocking operation in this crate reports failure through a tagged
//! result rather than a process-global error slot. The numeric POSIX codes
//! are preserved at the public boundary via [`Error::errno`] so that callers
//! bridging to C-style interfaces can keep the historical contract:
//! a cancelled fiber observes `ECANCELED`, an expired deadline `ETIMEDOUT`,
//! and so on.
//!
//! The channel module additionally defines its own error enums
//! ([`SendError`](crate::channel::SendError) and friends) which hand the
//! unsent value back to the caller; those all convert into [`Error`].

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The owner of the calling fiber demanded its termination. Once
    /// observed, every subsequent suspension point of that fiber keeps
    /// failing with this error.
    #[error("fiber was cancelled by its owner")]
    Cancelled,

    /// The absolute deadline passed before the operation could complete.
    /// A timed out call has consumed no message and armed no readiness.
    #[error("deadline reached")]
    TimedOut,

    /// Structural argument violation.
    #[error("invalid argument: {0}")]
    InvalidArg(&'static str),

    /// Fiber stack allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The channel is in the done state and will never accept a message.
    #[error("channel is done")]
    Pipe,

    /// Another fiber already waits on this descriptor and direction.
    #[error("descriptor is busy with another waiter")]
    Busy,

    /// The kernel rejected the file descriptor.
    #[error("bad file descriptor")]
    BadFd,

    #[error("io error: {0}")]
    IO(#[from] io::Error),
}

impl Error {
    /// The POSIX error code historically associated with this failure.
    #[inline]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Cancelled => libc::ECANCELED,
            Self::TimedOut => libc::ETIMEDOUT,
            Self::InvalidArg(_) => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::Pipe => libc::EPIPE,
            Self::Busy => libc::EEXIST,
            Self::BadFd => libc::EBADF,
            Self::IO(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Returns the name of the variant as it is spelled in the source code.
    pub const fn variant_name(&self) -> &'static str {
        match self {
            Self::Cancelled => "Cancelled",
            Self::TimedOut => "TimedOut",
            Self::InvalidArg(_) => "InvalidArg",
            Self::OutOfMemory => "OutOfMemory",
            Self::Pipe => "Pipe",
            Self::Busy => "Busy",
            Self::BadFd => "BadFd",
            Self::IO(_) => "IO",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Error;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::Cancelled.errno(), libc::ECANCELED);
        assert_eq!(Error::TimedOut.errno(), libc::ETIMEDOUT);
        assert_eq!(Error::InvalidArg("x").errno(), libc::EINVAL);
        assert_eq!(Error::OutOfMemory.errno(), libc::ENOMEM);
        assert_eq!(Error::Pipe.errno(), libc::EPIPE);
        assert_eq!(Error::Busy.errno(), libc::EEXIST);
        assert_eq!(Error::BadFd.errno(), libc::EBADF);
    }

    #[test]
    fn variant_names() {
        assert_eq!(Error::Cancelled.variant_name(), "Cancelled");
        assert_eq!(Error::Busy.variant_name(), "Busy");
    }
}
