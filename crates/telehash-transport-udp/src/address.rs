//! Network paths.
//!
//! Spec: a network path is opaque to the switch core; equality and hashing
//! are defined by the transport. For UDP we define them as the remote
//! socket address, matching `net/ipv4/transport.go`'s `Addr` in the
//! original implementation.

use std::fmt;
use std::net::SocketAddr;

/// A transport-addressable endpoint.
///
/// The switch core treats this as an opaque handle: it stores paths in a
/// peer's path set, picks an active path, and hands paths back to the
/// transport on send. It never inspects the address itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct NetworkPath {
    addr: SocketAddr,
}

impl NetworkPath {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "udp:{}", self.addr)
    }
}

impl From<SocketAddr> for NetworkPath {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}
