//! Switch-wide error domain.
//!
//! One `thiserror` enum carrying exactly the kinds named in the error
//! handling design: packet and decrypt failures are recovered locally
//! (logged, counted, dropped) and never reach this type; everything here
//! is surfaced either to a `Call` awaiter or attached to a cancelled
//! backlog entry.

use thiserror::Error;

use crate::hashname::Hashname;

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SwitchError {
    #[error("no peer record for hashname {0} and no introduction available")]
    UnknownPeer(Hashname),

    #[error("peer {0} has no active path")]
    PeerBroken(Hashname),

    #[error("channel or owning line has closed")]
    ChannelBroken,

    #[error("inbound line packet referenced an uninstalled line id")]
    UnknownLine,

    #[error("malformed inner or outer packet")]
    InvalidPacket,

    #[error("channel id {0:?} already exists on this line")]
    ChannelAlreadyExists(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("switch is terminating, no line may be opened")]
    NoOpenLine,

    #[error("read deadline reached with no packet available")]
    ReadDeadlineExceeded,

    #[error("internal switch failure: {detail}")]
    Internal { detail: String },
}

impl SwitchError {
    pub fn internal(detail: impl Into<String>) -> Self {
        SwitchError::Internal {
            detail: detail.into(),
        }
    }
}

impl From<telehash_transport_udp::TransportError> for SwitchError {
    fn from(_: telehash_transport_udp::TransportError) -> Self {
        SwitchError::TransportClosed
    }
}
