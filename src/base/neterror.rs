//! The error currency of the crate.
//!
//! Every fallible operation returns [`NetError`]. The taxonomy follows the
//! transport layer's needs rather than any protocol's:
//!
//! - *transient*: [`NetError::WouldBlock`], retried by re-arming a callback
//! - *timeout*: [`NetError::TimedOut`], the socket's deadline elapsed
//! - *peer EOF / reset*: [`NetError::Closed`], [`NetError::Reset`]
//! - *TLS*: [`NetError::Tls`] carries the library diagnostic text
//! - *resource exhaustion*: [`NetError::TooManyConnections`], refused and never queued
//! - *configuration*: [`NetError::Configuration`], fatal at configure/connect time

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// Nonblocking operation is not ready yet. Not a failure; queued forms
    /// intercept this and resume via the multiplexer.
    #[error("operation would block")]
    WouldBlock,
    #[error("operation timed out")]
    TimedOut,
    /// Peer performed an orderly close (EOF).
    #[error("connection closed by peer")]
    Closed,
    #[error("connection reset")]
    Reset,
    #[error("connection refused")]
    Refused,
    #[error("socket not connected")]
    NotConnected,
    /// `close`/`shutdown` on a socket whose descriptor was already released.
    #[error("socket already closed")]
    AlreadyClosed,
    /// A pending callback was superseded or its owner went away before the
    /// operation could complete.
    #[error("operation canceled")]
    Canceled,
    #[error("name not resolved")]
    NameNotResolved,
    #[error("invalid address: {0}")]
    AddressInvalid(String),
    /// Active connections are at the configured maximum; the new one is
    /// refused immediately rather than queued.
    #[error("too many active connections")]
    TooManyConnections,
    /// Delimiter scan exceeded the caller's byte limit.
    #[error("read limit exceeded before delimiter")]
    LimitExceeded,
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Built without the `tls` feature, or no TLS library available.
    #[error("TLS not supported in this build")]
    TlsNotSupported,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl NetError {
    /// Maps an OS-level error to the taxonomy, keeping the common socket
    /// conditions typed and falling back to [`NetError::Io`].
    pub fn from_os(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::WouldBlock,
            io::ErrorKind::ConnectionReset => NetError::Reset,
            io::ErrorKind::ConnectionRefused => NetError::Refused,
            io::ErrorKind::ConnectionAborted => NetError::Reset,
            io::ErrorKind::TimedOut => NetError::TimedOut,
            io::ErrorKind::NotConnected => NetError::NotConnected,
            io::ErrorKind::BrokenPipe => NetError::Closed,
            _ => NetError::Io(err),
        }
    }

    /// Maps `errno` after a raw libc call.
    pub fn from_errno() -> Self {
        Self::from_os(io::Error::last_os_error())
    }

    /// True for the transient class: the caller should re-arm and retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock)
    }
}

#[cfg(feature = "tls")]
impl From<boring::error::ErrorStack> for NetError {
    fn from(err: boring::error::ErrorStack) -> Self {
        NetError::Tls(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_os_wouldblock() {
        let err = NetError::from_os(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(matches!(err, NetError::WouldBlock));
        assert!(err.is_transient());
    }

    #[test]
    fn test_from_os_reset_and_refused() {
        assert!(matches!(
            NetError::from_os(io::Error::from(io::ErrorKind::ConnectionReset)),
            NetError::Reset
        ));
        assert!(matches!(
            NetError::from_os(io::Error::from(io::ErrorKind::ConnectionRefused)),
            NetError::Refused
        ));
    }

    #[test]
    fn test_from_os_fallback_is_io() {
        let err = NetError::from_os(io::Error::new(io::ErrorKind::Other, "boom"));
        assert!(matches!(err, NetError::Io(_)));
        assert!(!err.is_transient());
    }
}
