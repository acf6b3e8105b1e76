//! Transport error domain.
//!
//! Grounded in `spark-switch/src/error.rs`'s thiserror-enum-plus-From
//! pattern, and in the original source's `_net_conn_is_closed_err`
//! normalization: OS-level "connection closed" read/write errors collapse
//! to one stable [`TransportError::Closed`] variant instead of leaking raw
//! `io::ErrorKind`s up to the switch.

use std::io;

use thiserror::Error;

/// Errors raised by the UDP transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket was closed (locally, via [`super::UdpTransport::close`],
    /// or the OS reported the connection as no longer usable). Corresponds
    /// to spec.md's `ErrTransportClosed` / `ErrUDPConnClosed`.
    #[error("udp transport closed")]
    Closed,

    /// Any other I/O failure from the underlying socket.
    #[error("udp transport io error: {0}")]
    Io(#[source] io::Error),
}

impl TransportError {
    /// Normalize a raw socket error the way the original implementation's
    /// `_net_conn_is_closed_err` does: treat "connection closed" errors as
    /// [`TransportError::Closed`] rather than a generic I/O failure.
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => TransportError::Closed,
            _ => TransportError::Io(err),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}
