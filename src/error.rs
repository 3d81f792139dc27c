//! Error type shared by every operation of the library.

use std::io;

use thiserror::Error;

use crate::rdma::conn::ConnEvent;

/// Errors returned by `rrpma` operations.
///
/// Argument validation always happens before any hardware call, so an
/// [`Error::InvalidArgument`] never leaves a partial side effect behind.
#[derive(Debug, Error)]
pub enum Error {
    /// A required handle is absent, flags are zero, an offset is misaligned,
    /// a descriptor has the wrong size, or a range is out of bounds.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A wrapper allocation failed. Hardware state registered by the same
    /// call has already been rolled back.
    #[error("out of memory")]
    NoMemory,

    /// The underlying verbs or connection-manager call failed.
    /// The original OS error code is kept in the wrapped `io::Error`.
    #[error("provider error: {0}")]
    Provider(#[from] io::Error),

    /// The hardware, the memory region usage or the negotiated peer
    /// configuration does not support the requested operation.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// Nothing is in the completion queue right now.
    #[error("no completion available")]
    NoCompletion,

    /// No connection event is pending right now.
    #[error("no event available")]
    NoEvent,

    /// No incoming connection request is pending right now.
    #[error("no next connection request")]
    NoNext,

    /// A completion file descriptor was requested from a connection that has
    /// no shared completion channel.
    #[error("connection has no shared completion channel")]
    NotSharedChannel,

    /// A per-queue wait or file descriptor was requested from a completion
    /// queue that uses the connection's shared completion channel.
    #[error("completion queue uses a shared completion channel")]
    SharedChannel,

    /// The peer delivered a connection event other than the expected one.
    #[error("unexpected connection event: {0:?}")]
    UnexpectedEvent(ConnEvent),

    /// The hardware returned an internally inconsistent response.
    #[error("unknown error: {0}")]
    Unknown(&'static str),

    /// A configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),
}

impl Error {
    /// Build a provider error from a raw OS error code.
    #[inline]
    pub(crate) fn provider(code: i32) -> Self {
        Self::Provider(io::Error::from_raw_os_error(code))
    }

    /// Get the original provider error code, if this is a provider error
    /// that carries one.
    pub fn provider_code(&self) -> Option<i32> {
        match self {
            Self::Provider(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Whether this is a "nothing is ready right now" signal rather than a
    /// true failure.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoCompletion | Self::NoEvent | Self::NoNext)
    }
}

/// Result type of `rrpma` operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_code_is_preserved() {
        let err = Error::provider(libc::EBUSY);
        assert_eq!(err.provider_code(), Some(libc::EBUSY));
        assert!(!err.is_transient());
        assert_eq!(Error::NoMemory.provider_code(), None);
    }

    #[test]
    fn transient_kinds() {
        assert!(Error::NoCompletion.is_transient());
        assert!(Error::NoEvent.is_transient());
        assert!(Error::NoNext.is_transient());
        assert!(!Error::NotSharedChannel.is_transient());
    }
}
