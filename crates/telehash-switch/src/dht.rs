//! DHT / peer directory collaborator (§6).
//!
//! Out of scope: the overlay routing algorithm itself. The switch only
//! consumes a lookup hook and an `OnNewPeer` notification hook.

use crate::crypto::RsaPublicKey;
use crate::hashname::Hashname;
use telehash_transport_udp::NetworkPath;

/// What a directory knows about a hashname before the switch has ever
/// contacted it directly.
#[derive(Clone, Debug, Default)]
pub struct PeerDirectoryEntry {
    pub pubkey: Option<RsaPublicKey>,
    pub paths: Vec<NetworkPath>,
}

/// A peer directory / DHT. Multiple directories may be registered; they
/// are queried in registration order and the first hit wins.
pub trait PeerDirectory: Send + Sync + 'static {
    fn get_peer(&self, hashname: &Hashname) -> Option<PeerDirectoryEntry>;

    /// Called once, synchronously from the run loop, the first time a
    /// hashname is materialized into a `Peer`. Directories use this to
    /// populate their own peer table; the switch does not wait on it.
    fn on_new_peer(&self, hashname: &Hashname);
}
