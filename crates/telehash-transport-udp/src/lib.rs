//! UDP implementation of the transport collaborator spec.md §6 leaves
//! abstract: opaque network paths, and an `open`/`read`/`write`/`close`
//! surface the switch core depends on without knowing it is UDP.

pub mod address;
pub mod error;
pub mod transport;

pub use address::NetworkPath;
pub use error::TransportError;
pub use transport::{Transport, TransportCounters, UdpTransport};
