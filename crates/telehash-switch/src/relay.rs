//! Relay handler collaborator. Out of scope entirely (§1); the ingress
//! dispatcher (§4.8) only needs somewhere to hand off inner packets
//! whose `type == "relay"` and whose channel id is non-empty.

use crate::hashname::Hashname;
use crate::packet::InnerPacket;

pub trait RelayHandler: Send + Sync + 'static {
    fn handle_relay(&self, peer: Hashname, packet: InnerPacket);
}

/// Default handler when no relay collaborator is installed: drop and
/// log, matching the ingress dispatcher's "other types: silent drop"
/// policy for anything it doesn't otherwise route (§4.8).
#[derive(Default)]
pub struct NullRelayHandler;

impl RelayHandler for NullRelayHandler {
    fn handle_relay(&self, peer: Hashname, _packet: InnerPacket) {
        tracing::debug!(peer = %peer, "dropping relay packet: no relay handler installed");
    }
}
